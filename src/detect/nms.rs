//! Class-aware non-maximum suppression.

use crate::frame::Detection;

/// Keep the highest-confidence detection among same-class boxes overlapping
/// above `iou_threshold`. The result is ordered by descending confidence.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let suppressed = (0..kept).any(|prev| {
            detections[prev].class_id == detections[index].class_id
                && detections[prev].bbox.iou(&detections[index].bbox) > iou_threshold
        });
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

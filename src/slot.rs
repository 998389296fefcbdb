//! Latest-value holder shared by capture, inference and streaming.
//!
//! The frame and the detection set live in two independently locked cells, so
//! a capture loop publishing a frame never waits on an inference worker
//! publishing detections (and the other way round). Each critical section is a
//! single `Arc`/`Option` clone or swap.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::frame::{DetectionSet, Frame};

#[derive(Clone, Debug)]
struct DetectionCell {
    set: Arc<DetectionSet>,
    frame_id: Option<u64>,
}

/// Single-writer, multi-reader slot for one camera.
#[derive(Debug)]
pub struct FrameSlot {
    frame: Mutex<Option<Frame>>,
    detections: Mutex<DetectionCell>,
}

/// One read of both cells.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// `None` until the first frame is published.
    pub frame: Option<Frame>,
    pub detections: Arc<DetectionSet>,
    /// Frame id the detections were computed from. May lag `frame`.
    pub detection_frame_id: Option<u64>,
}

impl Snapshot {
    /// Frames between the detection set and the frame (0 when current).
    pub fn staleness(&self) -> Option<u64> {
        let frame_id = self.frame.as_ref()?.id;
        let det_id = self.detection_frame_id?;
        Some(frame_id.saturating_sub(det_id))
    }
}

// Values are replaced whole, so a poisoned cell still holds a consistent value.
fn lock<T>(cell: &Mutex<T>) -> MutexGuard<'_, T> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            detections: Mutex::new(DetectionCell {
                set: Arc::new(DetectionSet::empty()),
                frame_id: None,
            }),
        }
    }

    /// Replace the stored frame.
    pub fn publish_frame(&self, frame: Frame) {
        let previous = {
            let mut guard = lock(&self.frame);
            guard.replace(frame)
        };
        // Drop the old frame outside the lock; it may be the last pixel reference.
        drop(previous);
    }

    /// Replace the stored detection set and the frame id it belongs to.
    pub fn publish_detections(&self, detections: DetectionSet, frame_id: u64) {
        let cell = DetectionCell {
            set: Arc::new(detections),
            frame_id: Some(frame_id),
        };
        let previous = std::mem::replace(&mut *lock(&self.detections), cell);
        drop(previous);
    }

    pub fn snapshot(&self) -> Snapshot {
        let frame = self.latest_frame();
        let cell = lock(&self.detections).clone();
        Snapshot {
            frame,
            detections: cell.set,
            detection_frame_id: cell.frame_id,
        }
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        lock(&self.frame).clone()
    }

    pub fn latest_frame_id(&self) -> Option<u64> {
        lock(&self.frame).as_ref().map(|frame| frame.id)
    }

    pub fn latest_detections(&self) -> Arc<DetectionSet> {
        lock(&self.detections).set.clone()
    }

    pub fn latest_detection_frame_id(&self) -> Option<u64> {
        lock(&self.detections).frame_id
    }

    #[cfg(test)]
    fn hold_detections(&self) -> MutexGuard<'_, DetectionCell> {
        lock(&self.detections)
    }

    #[cfg(test)]
    fn hold_frame(&self) -> MutexGuard<'_, Option<Frame>> {
        lock(&self.frame)
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Detection};
    use image::RgbImage;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn frame(id: u64) -> Frame {
        Frame::new(id, RgbImage::new(2, 2))
    }

    #[test]
    fn empty_slot_has_no_frame_and_no_detections() {
        let slot = FrameSlot::new();
        let snap = slot.snapshot();
        assert!(snap.frame.is_none());
        assert!(snap.detections.is_empty());
        assert_eq!(snap.detection_frame_id, None);
        assert_eq!(snap.staleness(), None);
    }

    #[test]
    fn last_published_frame_wins() {
        let slot = FrameSlot::new();
        for id in 1..=50 {
            slot.publish_frame(frame(id));
        }
        assert_eq!(slot.snapshot().frame.map(|f| f.id), Some(50));
    }

    #[test]
    fn last_write_wins_under_concurrent_snapshots() {
        const LAST: u64 = 2_000;
        let slot = Arc::new(FrameSlot::new());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                thread::spawn(move || {
                    let mut seen = 0u64;
                    while seen < LAST {
                        if let Some(frame) = slot.snapshot().frame {
                            assert!(frame.id >= seen, "id went back from {} to {}", seen, frame.id);
                            seen = frame.id;
                        }
                    }
                    seen
                })
            })
            .collect();

        for id in 1..=LAST {
            slot.publish_frame(frame(id));
        }
        for reader in readers {
            assert_eq!(reader.join().unwrap(), LAST);
        }
        assert_eq!(slot.snapshot().frame.map(|f| f.id), Some(LAST));
    }

    #[test]
    fn detections_track_their_own_frame_id() {
        let slot = FrameSlot::new();
        slot.publish_frame(frame(12));
        let set = DetectionSet::new(vec![Detection::new(
            1,
            0.9,
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
        )]);
        slot.publish_detections(set, 10);
        let snap = slot.snapshot();
        assert_eq!(snap.detections.len(), 1);
        assert_eq!(snap.detection_frame_id, Some(10));
        assert_eq!(snap.staleness(), Some(2));
    }

    #[test]
    fn frame_publish_is_not_blocked_by_held_detection_cell() {
        let slot = Arc::new(FrameSlot::new());
        let guard = slot.hold_detections();

        let (tx, rx) = mpsc::channel();
        let writer = slot.clone();
        let handle = thread::spawn(move || {
            writer.publish_frame(frame(1));
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2))
            .expect("frame publish blocked by detection reader");
        drop(guard);
        handle.join().unwrap();
        assert_eq!(slot.latest_frame_id(), Some(1));
    }

    #[test]
    fn detection_publish_is_not_blocked_by_held_frame_cell() {
        let slot = Arc::new(FrameSlot::new());
        let guard = slot.hold_frame();

        let (tx, rx) = mpsc::channel();
        let writer = slot.clone();
        let handle = thread::spawn(move || {
            writer.publish_detections(DetectionSet::empty(), 3);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2))
            .expect("detection publish blocked by frame reader");
        drop(guard);
        handle.join().unwrap();
        assert_eq!(slot.latest_detection_frame_id(), Some(3));
    }
}

//! Single-slot "latest value" caches shared between the capture/inference
//! threads and the broadcaster.
//!
//! A writer swaps the `Arc` and bumps the sequence under the lock; readers
//! clone the `Arc` under the same lock. Nothing is queued: a slow reader just
//! sees the newest value and skips whatever was overwritten in between.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::camera::Frame;
use crate::pose::DetectionResult;

/// Most recent camera frame.
pub type FrameCache = Latest<Frame>;

/// Most recent inference output.
pub type ResultCache = Latest<DetectionResult>;

struct Slot<T> {
    value: Option<Arc<T>>,
    seq: u64,
}

pub struct Latest<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Latest<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot { value: None, seq: 0 }),
        }
    }

    /// 新しい値で置き換え、シーケンス番号を返す
    pub fn update(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let mut slot = self.slot.lock();
        slot.value = Some(value);
        slot.seq += 1;
        slot.seq
    }

    /// 最新の値とシーケンス番号。初回更新前は `(None, 0)`。
    pub fn latest(&self) -> (Option<Arc<T>>, u64) {
        let slot = self.slot.lock();
        (slot.value.clone(), slot.seq)
    }

    pub fn sequence(&self) -> u64 {
        self.slot.lock().seq
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self::new()
    }
}

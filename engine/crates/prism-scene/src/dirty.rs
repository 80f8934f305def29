//! 脏标记
//!
//! 外部协作者在帧与帧之间通过 [`DirtyTracker::mark`] 报告哪些类别的数据发生了变化，
//! 帧调度在构建 job graph 时通过 [`DirtyTracker::take`] 一次性取走并清空。

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// 发生变化的数据类别
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirtySet: u32 {
        const TRANSFORM = 1 << 0;
        const GEOMETRY = 1 << 1;
        const MATERIAL = 1 << 2;
        const TEXTURE = 1 << 3;
        const LIGHT = 1 << 4;
        const CAMERA = 1 << 5;
        /// 可渲染实体的集合发生了变化（增删、启用禁用）
        const ENTITY = 1 << 6;
    }
}

impl DirtySet {
    pub const NONE: Self = Self::empty();
}

/// 两次 [`take`](Self::take) 之间只会被 OR，不会减少
#[derive(Debug, Default)]
pub struct DirtyTracker {
    bits: AtomicU32,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn mark(&self, dirty: DirtySet) {
        if dirty.is_empty() {
            return;
        }
        self.bits.fetch_or(dirty.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn peek(&self) -> DirtySet {
        DirtySet::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    /// 取走当前的脏标记，并原子地清空
    #[inline]
    pub fn take(&self) -> DirtySet {
        DirtySet::from_bits_truncate(self.bits.swap(0, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn marks_accumulate_until_take() {
        let tracker = DirtyTracker::new();
        assert_eq!(tracker.peek(), DirtySet::NONE);

        tracker.mark(DirtySet::TRANSFORM);
        tracker.mark(DirtySet::TEXTURE | DirtySet::TRANSFORM);
        assert_eq!(tracker.peek(), DirtySet::TRANSFORM | DirtySet::TEXTURE);

        assert_eq!(tracker.take(), DirtySet::TRANSFORM | DirtySet::TEXTURE);
        assert_eq!(tracker.take(), DirtySet::NONE);
    }

    #[test]
    fn marks_from_other_threads_are_not_lost() {
        let tracker = Arc::new(DirtyTracker::new());
        let categories = [DirtySet::GEOMETRY, DirtySet::LIGHT, DirtySet::CAMERA, DirtySet::ENTITY];

        let handles = categories
            .into_iter()
            .map(|category| {
                let tracker = tracker.clone();
                thread::spawn(move || tracker.mark(category))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.take(), DirtySet::GEOMETRY | DirtySet::LIGHT | DirtySet::CAMERA | DirtySet::ENTITY);
    }
}

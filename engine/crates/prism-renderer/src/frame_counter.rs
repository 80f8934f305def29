/// 帧计数
///
/// `frame_id` 一直累加，`frame_index` 是当前帧在 ring 中的 slot，
/// ring 的大小（在途帧数量）在初始化时由 surface 决定。
#[derive(Debug)]
pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
    fif_count: usize,
}

// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64, fif_count: usize) -> Self {
        assert!(fif_count > 0, "frames in flight must be positive");
        Self {
            frame_id: init_frame_id,
            fif_count,
        }
    }
}

// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}

// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn fif_count(&self) -> usize {
        self.fif_count
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        (self.frame_id % self.fif_count as u64) as usize
    }

    /// 上一帧使用的 slot，累积渲染从这里读取历史
    #[inline]
    pub fn previous_frame_index(&self) -> usize {
        (self.frame_index() + self.fif_count - 1) % self.fif_count
    }

    /// slot 的标签：A, B, C ...
    #[inline]
    pub fn frame_label(&self) -> char {
        (b'A' + (self.frame_index() % 26) as u8) as char
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

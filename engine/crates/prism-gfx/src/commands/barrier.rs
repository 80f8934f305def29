use ash::vk;

use crate::{commands::image_state::GfxImageState, handles::GfxImageHandle};

/// 便捷创建 image barrier 的结构体
///
/// 只描述 image 的状态转换，真正的 `vk::ImageMemoryBarrier2` 由设备在录制时生成。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxImageBarrier {
    pub image: GfxImageHandle,
    pub src: GfxImageState,
    pub dst: GfxImageState,
}

impl GfxImageBarrier {
    pub fn new(image: GfxImageHandle) -> Self {
        Self {
            image,
            src: GfxImageState::UNDEFINED,
            dst: GfxImageState::UNDEFINED,
        }
    }

    /// builder
    #[inline]
    pub fn transition(mut self, src: GfxImageState, dst: GfxImageState) -> Self {
        self.src = src;
        self.dst = dst;
        self
    }

    #[inline]
    pub fn old_layout(&self) -> vk::ImageLayout {
        self.src.layout
    }

    #[inline]
    pub fn new_layout(&self) -> vk::ImageLayout {
        self.dst.layout
    }

    /// src/dst 的 stage 与 access，src access 去掉了读操作
    #[inline]
    pub fn masks(&self) -> (vk::PipelineStageFlags2, vk::AccessFlags2, vk::PipelineStageFlags2, vk::AccessFlags2) {
        (self.src.stage, self.src.src_access(), self.dst.stage, self.dst.access)
    }
}

#[cfg(test)]
mod tests {
    use slotmap::KeyData;

    use super::*;

    #[test]
    fn transition_sets_layouts() {
        let image = GfxImageHandle::from(KeyData::from_ffi(1));
        let barrier = GfxImageBarrier::new(image)
            .transition(GfxImageState::UNDEFINED, GfxImageState::STORAGE_READ_WRITE_RAY_TRACING);

        assert_eq!(barrier.old_layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout(), vk::ImageLayout::GENERAL);
        let (_, src_access, dst_stage, _) = barrier.masks();
        assert_eq!(src_access, vk::AccessFlags2::NONE);
        assert_eq!(dst_stage, vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR);
    }
}

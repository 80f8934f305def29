use ash::vk;

use crate::handles::{GfxCommandBufferHandle, GfxSemaphoreHandle};

/// 一次 queue submit 的描述
#[derive(Clone, Debug, Default)]
pub struct GfxSubmitInfo {
    pub command_buffers: Vec<GfxCommandBufferHandle>,
    pub wait_infos: Vec<(GfxSemaphoreHandle, vk::PipelineStageFlags2)>,
    pub signal_infos: Vec<(GfxSemaphoreHandle, vk::PipelineStageFlags2)>,
}

impl GfxSubmitInfo {
    pub fn new(commands: &[GfxCommandBufferHandle]) -> Self {
        Self {
            command_buffers: commands.to_vec(),
            wait_infos: vec![],
            signal_infos: vec![],
        }
    }

    #[inline]
    pub fn wait(mut self, semaphore: GfxSemaphoreHandle, stage: vk::PipelineStageFlags2) -> Self {
        self.wait_infos.push((semaphore, stage));
        self
    }

    #[inline]
    pub fn signal(mut self, semaphore: GfxSemaphoreHandle, stage: vk::PipelineStageFlags2) -> Self {
        self.signal_infos.push((semaphore, stage));
        self
    }
}

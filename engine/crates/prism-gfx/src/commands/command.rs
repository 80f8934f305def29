use ash::vk;

use crate::{
    commands::barrier::GfxImageBarrier,
    handles::{
        GfxBufferHandle, GfxDescriptorSetHandle, GfxImageHandle, GfxPipelineHandle, GfxQueryPoolHandle,
    },
};

/// 录制进 command buffer 的一条命令
///
/// 帧调度只产生这些与 API 无关的命令，由 [`crate::device::GfxDevice::record_commands`]
/// 翻译成真正的 `vkCmd*` 调用。
#[derive(Clone, Debug, PartialEq)]
pub enum GfxCommand {
    ResetQueryPool {
        pool: GfxQueryPoolHandle,
        first_query: u32,
        query_count: u32,
    },
    WriteTimestamp {
        pool: GfxQueryPoolHandle,
        query: u32,
        stage: vk::PipelineStageFlags2,
    },
    ImageBarriers(Vec<GfxImageBarrier>),
    ClearColorImage {
        image: GfxImageHandle,
        layout: vk::ImageLayout,
        color: [f32; 4],
    },
    /// 绑定 descriptor sets、push constants 后 dispatch 光追，结果写入 `target`
    TraceRays {
        pipeline: GfxPipelineHandle,
        descriptor_sets: Vec<GfxDescriptorSetHandle>,
        push_constants: Vec<u8>,
        target: GfxImageHandle,
        extent: vk::Extent2D,
    },
    /// 全屏三角形将 `descriptor_set` 中的 render target tone-map 到 `target`
    DisplayPass {
        pipeline: GfxPipelineHandle,
        descriptor_set: GfxDescriptorSetHandle,
        push_constants: Vec<u8>,
        target: GfxImageHandle,
        extent: vk::Extent2D,
    },
    CopyImageToBuffer {
        image: GfxImageHandle,
        layout: vk::ImageLayout,
        buffer: GfxBufferHandle,
        extent: vk::Extent2D,
    },
    /// transfer write -> host read
    HostReadBarrier { buffer: GfxBufferHandle },
}

impl GfxCommand {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResetQueryPool { .. } => "reset-query-pool",
            Self::WriteTimestamp { .. } => "write-timestamp",
            Self::ImageBarriers(_) => "image-barriers",
            Self::ClearColorImage { .. } => "clear-color-image",
            Self::TraceRays { .. } => "trace-rays",
            Self::DisplayPass { .. } => "display-pass",
            Self::CopyImageToBuffer { .. } => "copy-image-to-buffer",
            Self::HostReadBarrier { .. } => "host-read-barrier",
        }
    }
}

use ash::vk;

use crate::{
    commands::{barrier::GfxImageBarrier, command::GfxCommand},
    device::GfxDevice,
    error::GfxResult,
    handles::{
        GfxBufferHandle, GfxCommandBufferHandle, GfxDescriptorSetHandle, GfxImageHandle, GfxPipelineHandle,
        GfxQueryPoolHandle,
    },
};

/// 一次 command buffer 录制
///
/// `begin` 之后只能以两种方式结束：`end` 把命令交给设备录制，或者直接 drop 放弃本次录制。
/// 不存在录制了一半就被提交的 command buffer。
#[must_use = "录制的命令需要通过 end 交给设备"]
pub struct GfxCommandEncoder {
    command_buffer: GfxCommandBufferHandle,
    commands: Vec<GfxCommand>,
    debug_name: String,
}

// new & init
impl GfxCommandEncoder {
    #[inline]
    pub fn begin(command_buffer: GfxCommandBufferHandle, debug_name: impl Into<String>) -> Self {
        Self {
            command_buffer,
            commands: Vec::with_capacity(16),
            debug_name: debug_name.into(),
        }
    }

    /// 结束录制，由设备生成真正的命令
    pub fn end(self, device: &dyn GfxDevice) -> GfxResult<GfxCommandBufferHandle> {
        log::trace!("[{}] record {} commands", self.debug_name, self.commands.len());
        device.record_commands(self.command_buffer, &self.commands)?;
        Ok(self.command_buffer)
    }
}

// getters
impl GfxCommandEncoder {
    #[inline]
    pub fn command_buffer(&self) -> GfxCommandBufferHandle {
        self.command_buffer
    }

    #[inline]
    pub fn commands(&self) -> &[GfxCommand] {
        &self.commands
    }
}

// 命令
impl GfxCommandEncoder {
    #[inline]
    pub fn reset_query_pool(&mut self, pool: GfxQueryPoolHandle, first_query: u32, query_count: u32) {
        self.commands.push(GfxCommand::ResetQueryPool {
            pool,
            first_query,
            query_count,
        });
    }

    #[inline]
    pub fn write_timestamp(&mut self, stage: vk::PipelineStageFlags2, pool: GfxQueryPoolHandle, query: u32) {
        self.commands.push(GfxCommand::WriteTimestamp { pool, query, stage });
    }

    /// 空的 barrier 列表不会产生命令
    #[inline]
    pub fn image_memory_barrier(&mut self, barriers: Vec<GfxImageBarrier>) {
        if barriers.is_empty() {
            return;
        }
        self.commands.push(GfxCommand::ImageBarriers(barriers));
    }

    #[inline]
    pub fn clear_color_image(&mut self, image: GfxImageHandle, layout: vk::ImageLayout, color: [f32; 4]) {
        self.commands.push(GfxCommand::ClearColorImage { image, layout, color });
    }

    pub fn trace_rays(
        &mut self,
        pipeline: GfxPipelineHandle,
        descriptor_sets: &[GfxDescriptorSetHandle],
        push_constants: &[u8],
        target: GfxImageHandle,
        extent: vk::Extent2D,
    ) {
        self.commands.push(GfxCommand::TraceRays {
            pipeline,
            descriptor_sets: descriptor_sets.to_vec(),
            push_constants: push_constants.to_vec(),
            target,
            extent,
        });
    }

    pub fn display_pass(
        &mut self,
        pipeline: GfxPipelineHandle,
        descriptor_set: GfxDescriptorSetHandle,
        push_constants: &[u8],
        target: GfxImageHandle,
        extent: vk::Extent2D,
    ) {
        self.commands.push(GfxCommand::DisplayPass {
            pipeline,
            descriptor_set,
            push_constants: push_constants.to_vec(),
            target,
            extent,
        });
    }

    #[inline]
    pub fn copy_image_to_buffer(
        &mut self,
        image: GfxImageHandle,
        layout: vk::ImageLayout,
        buffer: GfxBufferHandle,
        extent: vk::Extent2D,
    ) {
        self.commands.push(GfxCommand::CopyImageToBuffer {
            image,
            layout,
            buffer,
            extent,
        });
    }

    #[inline]
    pub fn host_read_barrier(&mut self, buffer: GfxBufferHandle) {
        self.commands.push(GfxCommand::HostReadBarrier { buffer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null_device::{GfxCall, NullDevice};

    #[test]
    fn dropped_encoder_records_nothing() {
        let device = NullDevice::new();
        let cmd = device.allocate_command_buffers(1, "test").unwrap()[0];
        let pool = device.create_query_pool(2, "test").unwrap();

        {
            let mut encoder = GfxCommandEncoder::begin(cmd, "abandoned");
            encoder.reset_query_pool(pool, 0, 2);
        }

        assert!(!device.calls().iter().any(|call| matches!(call, GfxCall::RecordCommands { .. })));
    }

    #[test]
    fn end_keeps_command_order() {
        let device = NullDevice::new();
        let cmd = device.allocate_command_buffers(1, "test").unwrap()[0];
        let pool = device.create_query_pool(2, "test").unwrap();

        let mut encoder = GfxCommandEncoder::begin(cmd, "frame");
        encoder.reset_query_pool(pool, 0, 2);
        encoder.write_timestamp(vk::PipelineStageFlags2::TOP_OF_PIPE, pool, 0);
        encoder.image_memory_barrier(vec![]);
        encoder.write_timestamp(vk::PipelineStageFlags2::BOTTOM_OF_PIPE, pool, 1);
        encoder.end(&device).unwrap();

        let names = device.recorded_commands(cmd).iter().map(GfxCommand::name).collect::<Vec<_>>();
        assert_eq!(names, vec!["reset-query-pool", "write-timestamp", "write-timestamp"]);
    }
}

//! 把 render target 或者最后呈现的 swapchain image 读回 CPU

use ash::vk;
use prism_gfx::{
    commands::{
        barrier::GfxImageBarrier, encoder::GfxCommandEncoder, image_state::GfxImageState, submit_info::GfxSubmitInfo,
    },
    device::{GfxBufferCreateInfo, GfxDevice},
    error::GfxResult,
    handles::{GfxBufferHandle, GfxCommandBufferHandle, GfxFenceHandle, GfxImageHandle},
};

use crate::error::RendererResult;

/// 可以读回的图像
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderImage {
    /// 最近一次光追写入的 render target
    Hdr,
    /// 最近一次呈现的 swapchain image
    FinalLdr,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValueType {
    #[default]
    UInt8,
    Float16,
    Float32,
}

impl ValueType {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::Float16 => 2,
            Self::Float32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelOrder {
    #[default]
    Rgba,
    Bgra,
}

/// 读回的像素数据，紧密排列
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub value_type: ValueType,
    pub channel_order: ChannelOrder,
    pub data: Vec<u8>,
}

impl ImageData {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 支持读回的格式
pub fn pixel_layout(format: vk::Format) -> Option<(ValueType, ChannelOrder)> {
    match format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Some((ValueType::UInt8, ChannelOrder::Rgba)),
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => Some((ValueType::UInt8, ChannelOrder::Bgra)),
        vk::Format::R16G16B16A16_SFLOAT => Some((ValueType::Float16, ChannelOrder::Rgba)),
        vk::Format::R32G32B32A32_SFLOAT => Some((ValueType::Float32, ChannelOrder::Rgba)),
        _ => None,
    }
}

/// 同步地把 `image` 拷贝到一个 host 可见的 staging buffer 并读出
///
/// `state` 是 image 当前所处的状态，拷贝完成后会恢复到这个状态。
/// 不支持的格式或空尺寸返回空的 [`ImageData`]。
pub fn read_image(
    device: &dyn GfxDevice,
    image: GfxImageHandle,
    state: GfxImageState,
    extent: vk::Extent2D,
    format: vk::Format,
    timeout_ns: u64,
) -> RendererResult<ImageData> {
    let _span = tracy_client::span!("read_image");

    let Some((value_type, channel_order)) = pixel_layout(format) else {
        log::warn!("cannot read back image with format {:?}", format);
        return Ok(ImageData::default());
    };
    if extent.width == 0 || extent.height == 0 {
        return Ok(ImageData::default());
    }

    let channels = 4;
    let size = extent.width as vk::DeviceSize
        * extent.height as vk::DeviceSize
        * channels as vk::DeviceSize
        * value_type.size() as vk::DeviceSize;

    let staging = device.create_buffer(&GfxBufferCreateInfo {
        size,
        usage: vk::BufferUsageFlags::TRANSFER_DST,
        host_visible: true,
        debug_name: "readback-staging".to_string(),
    })?;
    let command_buffer = match device.allocate_command_buffers(1, "readback") {
        Ok(command_buffers) => command_buffers[0],
        Err(err) => {
            device.destroy_buffer(staging);
            return Err(err.into());
        }
    };
    let fence = match device.create_fence(false, "readback") {
        Ok(fence) => fence,
        Err(err) => {
            device.free_command_buffers(&[command_buffer]);
            device.destroy_buffer(staging);
            return Err(err.into());
        }
    };

    let result = copy_to_staging(device, command_buffer, fence, image, state, staging, extent, timeout_ns);

    // 超时时 GPU 可能仍在使用这些资源，设备无法 idle 时只能泄漏它们
    let idle = match &result {
        Ok(_) => Ok(()),
        Err(_) => device.wait_idle(),
    };
    match idle {
        Ok(()) => {
            device.destroy_fence(fence);
            device.free_command_buffers(&[command_buffer]);
            device.destroy_buffer(staging);
        }
        Err(err) => log::error!("device did not become idle after a failed readback, resources leaked: {}", err),
    }

    Ok(ImageData {
        width: extent.width,
        height: extent.height,
        channels,
        value_type,
        channel_order,
        data: result?,
    })
}

#[allow(clippy::too_many_arguments)]
fn copy_to_staging(
    device: &dyn GfxDevice,
    command_buffer: GfxCommandBufferHandle,
    fence: GfxFenceHandle,
    image: GfxImageHandle,
    state: GfxImageState,
    staging: GfxBufferHandle,
    extent: vk::Extent2D,
    timeout_ns: u64,
) -> GfxResult<Vec<u8>> {
    let mut encoder = GfxCommandEncoder::begin(command_buffer, "readback");
    encoder.image_memory_barrier(vec![GfxImageBarrier::new(image).transition(state, GfxImageState::TRANSFER_SRC)]);
    encoder.copy_image_to_buffer(image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, staging, extent);
    encoder.image_memory_barrier(vec![GfxImageBarrier::new(image).transition(GfxImageState::TRANSFER_SRC, state)]);
    encoder.host_read_barrier(staging);
    let command_buffer = encoder.end(device)?;

    device.submit(&GfxSubmitInfo::new(&[command_buffer]), Some(fence))?;
    device.wait_for_fence(fence, timeout_ns)?;
    device.read_buffer(staging)
}

#[cfg(test)]
mod tests {
    use prism_gfx::{
        device::GfxImageCreateInfo,
        null_device::{NullDevice, NullFailure},
    };

    use super::*;

    fn image(device: &NullDevice, format: vk::Format) -> GfxImageHandle {
        device
            .create_image(&GfxImageCreateInfo {
                extent: vk::Extent2D { width: 4, height: 2 },
                format,
                usage: vk::ImageUsageFlags::TRANSFER_SRC,
                debug_name: "readback-test".to_string(),
            })
            .unwrap()
    }

    #[test]
    fn reads_float_target() {
        let device = NullDevice::new();
        let target = image(&device, vk::Format::R32G32B32A32_SFLOAT);
        let data = read_image(
            &device,
            target,
            GfxImageState::STORAGE_READ_WRITE_RAY_TRACING,
            vk::Extent2D { width: 4, height: 2 },
            vk::Format::R32G32B32A32_SFLOAT,
            u64::MAX,
        )
        .unwrap();

        assert_eq!(data.value_type, ValueType::Float32);
        assert_eq!(data.data.len(), 4 * 2 * 4 * 4);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn bgra_layout_and_unsupported_format() {
        assert_eq!(pixel_layout(vk::Format::B8G8R8A8_SRGB), Some((ValueType::UInt8, ChannelOrder::Bgra)));

        let device = NullDevice::new();
        let target = image(&device, vk::Format::D32_SFLOAT);
        let data = read_image(
            &device,
            target,
            GfxImageState::PRESENT,
            vk::Extent2D { width: 4, height: 2 },
            vk::Format::D32_SFLOAT,
            u64::MAX,
        )
        .unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn submit_failure_releases_staging() {
        let device = NullDevice::new();
        let target = image(&device, vk::Format::R8G8B8A8_UNORM);
        device.inject_failure(NullFailure::Submit, 1);
        let result = read_image(
            &device,
            target,
            GfxImageState::PRESENT,
            vk::Extent2D { width: 4, height: 2 },
            vk::Format::R8G8B8A8_UNORM,
            u64::MAX,
        );
        assert!(result.is_err());
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn timed_out_readback_keeps_resources_the_device_may_use() {
        let device = NullDevice::new();
        let target = image(&device, vk::Format::R8G8B8A8_UNORM);
        let read = || {
            read_image(
                &device,
                target,
                GfxImageState::PRESENT,
                vk::Extent2D { width: 4, height: 2 },
                vk::Format::R8G8B8A8_UNORM,
                1_000,
            )
        };

        // 超时后设备 idle 成功，资源正常释放
        device.inject_failure(NullFailure::WaitFence, 1);
        assert!(read().is_err());
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_command_buffers(), 0);

        device.inject_failure(NullFailure::WaitFence, 1);
        device.inject_failure(NullFailure::WaitIdle, 1);
        assert!(read().is_err());
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(device.live_fences(), 1);
        assert_eq!(device.live_command_buffers(), 1);
    }
}

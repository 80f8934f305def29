//! swapchain 参数选择
//!
//! swapchain 本身由设备创建，这里只负责根据 surface 能力选出 extent、格式、呈现模式以及 image 数量。

use ash::vk;

use crate::handles::GfxSurfaceHandle;

/// surface 当前的能力
#[derive(Clone, Debug, Default)]
pub struct GfxSurfaceCapabilities {
    pub current_extent: vk::Extent2D,
    pub min_image_extent: vk::Extent2D,
    pub max_image_extent: vk::Extent2D,
    pub min_image_count: u32,
    /// 0 表示没有上限
    pub max_image_count: u32,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Clone, Copy, Debug)]
pub struct GfxSwapchainCreateInfo {
    pub surface: GfxSurfaceHandle,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxAcquireResult {
    Acquired { image_index: u32, suboptimal: bool },
    /// swapchain 已经与 surface 不匹配，需要重建
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxPresentResult {
    Presented { suboptimal: bool },
    OutOfDate,
}

impl GfxAcquireResult {
    /// 是否需要重建 swapchain
    ///
    /// suboptimal 的 image 仍然可以呈现，尺寸变化由每帧的 surface 查询负责
    #[inline]
    pub fn need_recreate(&self) -> bool {
        matches!(self, Self::OutOfDate)
    }
}

impl GfxPresentResult {
    #[inline]
    pub fn need_recreate(&self) -> bool {
        matches!(self, Self::OutOfDate)
    }
}

/// 如果 surface_capabilities.current_extent 包含特殊值 0xFFFFFFFF，则表示可以自己设置交换链的 extent
pub fn calculate_swapchain_extent(
    surface_capabilities: &GfxSurfaceCapabilities,
    window_physical_extent: vk::Extent2D,
) -> vk::Extent2D {
    let surface_extent = surface_capabilities.current_extent;
    if surface_extent.width == 0xFFFFFFFF || surface_extent.height == 0xFFFFFFFF {
        let width = window_physical_extent
            .width
            .clamp(surface_capabilities.min_image_extent.width, surface_capabilities.max_image_extent.width);
        let height = window_physical_extent
            .height
            .clamp(surface_capabilities.min_image_extent.height, surface_capabilities.max_image_extent.height);
        vk::Extent2D { width, height }
    } else {
        surface_extent
    }
}

/// 宽或高为 0 时（例如窗口最小化）不能创建 swapchain
#[inline]
pub fn is_empty_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// 开启 vsync 时固定使用 FIFO；否则依次尝试 MAILBOX、IMMEDIATE，最后回退到总是可用的 FIFO
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR], enable_vsync: bool) -> vk::PresentModeKHR {
    if enable_vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| present_modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// 优先选择 8bit UNORM + sRGB 非线性色彩空间，否则使用 surface 报告的第一个格式
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            matches!(f.format, vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// swapchain 的 image 数量：比最小值多一张，同时不超过上限
#[inline]
pub fn swapchain_image_count(surface_capabilities: &GfxSurfaceCapabilities) -> u32 {
    if surface_capabilities.max_image_count == 0 {
        surface_capabilities.min_image_count + 1
    } else {
        u32::min(surface_capabilities.max_image_count, surface_capabilities.min_image_count + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: vk::Extent2D) -> GfxSurfaceCapabilities {
        GfxSurfaceCapabilities {
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        }
    }

    #[test]
    fn special_extent_uses_window_size() {
        let caps = caps(vk::Extent2D {
            width: 0xFFFFFFFF,
            height: 0xFFFFFFFF,
        });
        let extent = calculate_swapchain_extent(
            &caps,
            vk::Extent2D {
                width: 8000,
                height: 600,
            },
        );
        assert_eq!(
            extent,
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn present_mode_preference() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&all[..2], false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(&all[..1], false), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_fallback() {
        assert!(choose_surface_format(&[]).is_none());

        let hdr = vk::SurfaceFormatKHR {
            format: vk::Format::A2B10G10R10_UNORM_PACK32,
            color_space: vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        };
        let bgra = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[hdr]).map(|f| f.format), Some(hdr.format));
        assert_eq!(choose_surface_format(&[hdr, bgra]).map(|f| f.format), Some(vk::Format::B8G8R8A8_UNORM));
    }

    #[test]
    fn image_count_is_clamped() {
        let mut caps = caps(vk::Extent2D { width: 1, height: 1 });
        assert_eq!(swapchain_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(swapchain_image_count(&caps), 2);
        caps.max_image_count = 0;
        assert_eq!(swapchain_image_count(&caps), 3);
    }
}

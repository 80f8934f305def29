//! 呈现目标的管理
//!
//! swapchain 跟随 surface 的尺寸整体重建；尺寸为空（窗口最小化）时销毁 swapchain，
//! 直到尺寸恢复之前都不再呈现。acquire 与 present 只需要共享访问，
//! 只有重建需要独占访问。

use ash::vk;
use itertools::Itertools;
use prism_gfx::{
    device::GfxDevice,
    handles::{GfxImageHandle, GfxSemaphoreHandle, GfxSurfaceHandle, GfxSwapchainHandle},
    swapchain::{
        GfxAcquireResult, GfxPresentResult, GfxSwapchainCreateInfo, calculate_swapchain_extent, choose_present_mode,
        choose_surface_format, is_empty_extent, swapchain_image_count,
    },
};

use crate::error::{CreationContext, RendererError, RendererResult};

/// 一次尺寸检查的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainChange {
    Unchanged,
    Recreated(vk::Extent2D),
    /// surface 尺寸为空，swapchain 已销毁
    Released,
}

pub struct SwapchainManager {
    surface: GfxSurfaceHandle,
    swapchain: Option<GfxSwapchainHandle>,
    images: Vec<GfxImageHandle>,
    extent: vk::Extent2D,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,

    /// 每张 swapchain image 一个，提交时 signal，present 时等待
    render_complete: Vec<GfxSemaphoreHandle>,

    enable_vsync: bool,
    /// surface 不报告尺寸时使用的窗口尺寸
    window_extent: vk::Extent2D,
}

// new & init
impl SwapchainManager {
    /// surface 尺寸为空时不会创建 swapchain，等待之后的 [`Self::check_resize`]
    pub fn new(
        device: &dyn GfxDevice,
        surface: GfxSurfaceHandle,
        enable_vsync: bool,
        window_extent: vk::Extent2D,
    ) -> RendererResult<Self> {
        let capabilities = device.surface_capabilities(surface).creating("surface capabilities")?;
        let format = choose_surface_format(&capabilities.formats).ok_or(RendererError::NoSurfaceFormat)?;
        let present_mode = choose_present_mode(&capabilities.present_modes, enable_vsync);

        let mut manager = Self {
            surface,
            swapchain: None,
            images: Vec::new(),
            extent: vk::Extent2D::default(),
            format,
            present_mode,
            render_complete: Vec::new(),
            enable_vsync,
            window_extent,
        };
        if let Err(err) = manager.check_resize(device, false) {
            manager.destroy(device);
            return Err(err);
        }

        log::info!(
            "swapchain manager: format {:?}, present mode {:?}, extent {}x{}",
            format.format,
            present_mode,
            manager.extent.width,
            manager.extent.height
        );
        Ok(manager)
    }
}

// getters
impl SwapchainManager {
    #[inline]
    pub fn surface(&self) -> GfxSurfaceHandle {
        self.surface
    }

    #[inline]
    pub fn has_swapchain(&self) -> bool {
        self.swapchain.is_some()
    }

    /// 没有 swapchain 时为空
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image(&self, image_index: u32) -> Option<GfxImageHandle> {
        self.images.get(image_index as usize).copied()
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn render_complete(&self, image_index: u32) -> Option<GfxSemaphoreHandle> {
        self.render_complete.get(image_index as usize).copied()
    }

    /// 实时查询 surface 的尺寸，判断是否需要调用 [`Self::check_resize`]
    pub fn needs_resize(&self, device: &dyn GfxDevice, force: bool) -> RendererResult<bool> {
        let extent = self.query_extent(device)?;
        if is_empty_extent(extent) {
            return Ok(self.swapchain.is_some());
        }
        Ok(force || self.swapchain.is_none() || extent != self.extent)
    }
}

// update
impl SwapchainManager {
    /// 检查 surface 的尺寸，必要时销毁或重建 swapchain
    ///
    /// `force` 表示即使尺寸没有变化也要重建（acquire 或 present 返回 out of date）。
    /// 在销毁任何 swapchain 相关资源之前都会先等待设备 idle。
    pub fn check_resize(&mut self, device: &dyn GfxDevice, force: bool) -> RendererResult<SwapchainChange> {
        let capabilities = device.surface_capabilities(self.surface)?;
        let extent = calculate_swapchain_extent(&capabilities, self.window_extent);

        if is_empty_extent(extent) {
            if self.swapchain.is_none() {
                return Ok(SwapchainChange::Unchanged);
            }
            log::info!("surface extent is empty, swapchain released");
            device.wait_idle()?;
            self.release(device);
            return Ok(SwapchainChange::Released);
        }

        if !force && self.swapchain.is_some() && extent == self.extent {
            return Ok(SwapchainChange::Unchanged);
        }

        device.wait_idle()?;

        if let Some(format) = choose_surface_format(&capabilities.formats) {
            self.format = format;
        }
        self.present_mode = choose_present_mode(&capabilities.present_modes, self.enable_vsync);

        let create_info = GfxSwapchainCreateInfo {
            surface: self.surface,
            format: self.format,
            present_mode: self.present_mode,
            extent,
            min_image_count: swapchain_image_count(&capabilities),
        };
        let swapchain = match device.create_swapchain(&create_info, self.swapchain) {
            Ok(swapchain) => swapchain,
            Err(err) => {
                log::warn!("failed to resize swapchain: {}", err);
                self.release(device);
                return Err(err.into());
            }
        };
        self.release(device);

        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(err) => {
                device.destroy_swapchain(swapchain);
                return Err(err.into());
            }
        };
        let mut render_complete = Vec::with_capacity(images.len());
        for i in 0..images.len() {
            match device.create_semaphore(&format!("render-complete-{i}")) {
                Ok(semaphore) => render_complete.push(semaphore),
                Err(err) => {
                    render_complete.into_iter().for_each(|s| device.destroy_semaphore(s));
                    device.destroy_swapchain(swapchain);
                    return Err(err.into());
                }
            }
        }

        log::info!(
            "create swapchain:
            surface current extent: {}x{}, min extent: {}x{}, max extent: {}x{}
            final swapchain extent: {}x{}, {} images",
            capabilities.current_extent.width,
            capabilities.current_extent.height,
            capabilities.min_image_extent.width,
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.width,
            capabilities.max_image_extent.height,
            extent.width,
            extent.height,
            images.len()
        );
        self.swapchain = Some(swapchain);
        self.images = images;
        self.render_complete = render_complete;
        self.extent = extent;
        Ok(SwapchainChange::Recreated(extent))
    }

    /// 获取下一张 image，没有 swapchain 或者出错时返回 None
    pub fn acquire(
        &self,
        device: &dyn GfxDevice,
        image_available: GfxSemaphoreHandle,
        timeout_ns: u64,
    ) -> Option<GfxAcquireResult> {
        let swapchain = self.swapchain?;
        match device.acquire_next_image(swapchain, image_available, timeout_ns) {
            Ok(result) => {
                match result {
                    GfxAcquireResult::Acquired {
                        image_index,
                        suboptimal: true,
                    } => log::debug!("swapchain acquire image index {} is not optimal", image_index),
                    GfxAcquireResult::OutOfDate => log::debug!("swapchain out of date while acquiring"),
                    _ => {}
                }
                Some(result)
            }
            Err(err) => {
                log::error!("failed to acquire next swapchain image: {}", err);
                None
            }
        }
    }

    /// 出错时返回 None
    pub fn present(&self, device: &dyn GfxDevice, image_index: u32) -> Option<GfxPresentResult> {
        let swapchain = self.swapchain?;
        let wait_semaphores = self.render_complete(image_index).into_iter().collect_vec();
        match device.present(swapchain, image_index, &wait_semaphores) {
            Ok(result) => Some(result),
            Err(err) => {
                log::error!("failed to queue swapchain image for presentation: {}", err);
                None
            }
        }
    }
}

// tools
impl SwapchainManager {
    fn query_extent(&self, device: &dyn GfxDevice) -> RendererResult<vk::Extent2D> {
        let capabilities = device.surface_capabilities(self.surface)?;
        Ok(calculate_swapchain_extent(&capabilities, self.window_extent))
    }
}

// destroy
impl SwapchainManager {
    /// 销毁 swapchain 以及依赖它的资源，调用方需要保证设备已经 idle
    pub fn release(&mut self, device: &dyn GfxDevice) {
        for semaphore in self.render_complete.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        self.images.clear();
        if let Some(swapchain) = self.swapchain.take() {
            device.destroy_swapchain(swapchain);
        }
        self.extent = vk::Extent2D::default();
    }

    pub fn destroy(&mut self, device: &dyn GfxDevice) {
        self.release(device);
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::null_device::{GfxCall, NullDevice, NullFailure};

    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 64,
        height: 32,
    };

    fn manager(device: &NullDevice) -> SwapchainManager {
        let surface = device.create_surface(EXTENT);
        SwapchainManager::new(device, surface, false, vk::Extent2D {
            width: 640,
            height: 480,
        })
        .unwrap()
    }

    #[test]
    fn created_with_surface_extent() {
        let device = NullDevice::new();
        let manager = manager(&device);
        assert!(manager.has_swapchain());
        assert_eq!(manager.extent(), EXTENT);
        assert_eq!(manager.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(manager.image_count(), 4);
        assert!(manager.render_complete(3).is_some());
        assert!(!manager.needs_resize(&device, false).unwrap());
        assert!(manager.needs_resize(&device, true).unwrap());
    }

    #[test]
    fn surface_without_formats_is_fatal() {
        let device = NullDevice::new();
        let surface = device.create_surface_with(Default::default());
        let result = SwapchainManager::new(&device, surface, false, EXTENT);
        assert!(matches!(result, Err(RendererError::NoSurfaceFormat)));
        assert_eq!(device.live_swapchains(), 0);
    }

    #[test]
    fn empty_extent_releases_until_restored() {
        let device = NullDevice::new();
        let mut manager = manager(&device);
        let surface = manager.surface();
        let semaphore = device.create_semaphore("acquire").unwrap();

        device.set_surface_extent(surface, vk::Extent2D::default());
        assert!(manager.needs_resize(&device, false).unwrap());
        assert_eq!(manager.check_resize(&device, false).unwrap(), SwapchainChange::Released);
        assert!(!manager.has_swapchain());
        assert_eq!(manager.acquire(&device, semaphore, u64::MAX), None);
        assert!(!manager.needs_resize(&device, true).unwrap());
        assert_eq!(manager.check_resize(&device, true).unwrap(), SwapchainChange::Unchanged);

        let restored = vk::Extent2D {
            width: 128,
            height: 128,
        };
        device.set_surface_extent(surface, restored);
        assert_eq!(manager.check_resize(&device, false).unwrap(), SwapchainChange::Recreated(restored));
        assert_eq!(device.live_swapchains(), 1);
        assert_eq!(device.live_semaphores(), 1 + manager.image_count());
    }

    #[test]
    fn resize_passes_old_swapchain() {
        let device = NullDevice::new();
        let mut manager = manager(&device);
        let old = manager.swapchain.unwrap();

        device.set_surface_extent(manager.surface(), vk::Extent2D {
            width: 100,
            height: 100,
        });
        manager.check_resize(&device, false).unwrap();

        let calls = device.calls();
        assert!(calls.iter().any(|call| matches!(
            call,
            GfxCall::CreateSwapchain { old_swapchain: Some(prev), .. } if *prev == old
        )));
        let idle = calls.iter().position(|c| *c == GfxCall::WaitIdle).unwrap();
        let destroy = calls.iter().position(|c| *c == GfxCall::DestroySwapchain(old)).unwrap();
        assert!(idle < destroy);
    }

    #[test]
    fn out_of_date_is_reported() {
        let device = NullDevice::new();
        let manager = manager(&device);
        let semaphore = device.create_semaphore("acquire").unwrap();
        device.inject_failure(NullFailure::Acquire, 1);

        let result = manager.acquire(&device, semaphore, u64::MAX).unwrap();
        assert!(result.need_recreate());
        assert!(matches!(
            manager.acquire(&device, semaphore, u64::MAX),
            Some(GfxAcquireResult::Acquired { suboptimal: false, .. })
        ));
    }

    #[test]
    fn failed_recreate_leaves_no_swapchain() {
        let device = NullDevice::new();
        let mut manager = manager(&device);
        device.inject_failure(NullFailure::CreateSwapchain, 1);

        assert!(manager.check_resize(&device, true).is_err());
        assert!(!manager.has_swapchain());
        assert_eq!(device.live_swapchains(), 0);
        assert!(manager.needs_resize(&device, false).unwrap());
        assert!(matches!(manager.check_resize(&device, false).unwrap(), SwapchainChange::Recreated(_)));
    }
}

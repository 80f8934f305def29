//! 在途帧的资源环
//!
//! N 个 slot 轮流使用。slot i 的 fence 在提交时交给 GPU，CPU 再次使用 slot i 的 command buffer
//! 或 render target 之前必须等到它 signal。上一个 slot 的 render target 是累积渲染的历史输入。

use ash::vk;
use prism_gfx::{
    descriptors::{GfxDescriptorResource, GfxDescriptorSetLayout, GfxDescriptorWrite, binding},
    device::{GfxDevice, GfxImageCreateInfo},
    handles::*,
    swapchain::GfxSurfaceCapabilities,
};

use crate::{
    error::{CreationContext, RendererResult},
    frame_counter::FrameCounter,
};

/// 一个 ring slot 拥有的资源
#[derive(Debug)]
pub struct FrameSlot {
    pub command_buffer: GfxCommandBufferHandle,
    /// 创建时为 signaled
    pub fence: GfxFenceHandle,
    /// acquire swapchain image 时 signal，提交时等待
    pub image_available: GfxSemaphoreHandle,
    /// display pass 采样 render target
    pub display_set: GfxDescriptorSetHandle,
    /// 光追 pass 的 TLAS、render target 以及场景 buffer
    pub render_set: GfxDescriptorSetHandle,
    pub render_target: Option<GfxImageHandle>,
    /// 提交过 timestamp 且还没有读取
    pub timestamp_pending: bool,
}

/// 光追需要绑定的场景资源
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SceneBindings {
    pub tlas: Option<GfxAccelerationHandle>,
    pub instances: Option<GfxBufferHandle>,
    pub materials: Option<GfxBufferHandle>,
    pub emitters: Option<GfxBufferHandle>,
}

pub struct FrameRing {
    slots: Vec<FrameSlot>,
    counter: FrameCounter,
    /// 每个 slot 两个 timestamp：2i 开始，2i+1 结束
    query_pool: Option<GfxQueryPoolHandle>,

    target_format: vk::Format,
    target_extent: vk::Extent2D,
    /// render target 是否已经做过初始的 layout 转换
    targets_initialized: bool,
    /// 下一帧需要清空上一个 slot 的 render target，只生效一次
    clear_previous: bool,

    fence_timeout_ns: u64,
}

// new & init
impl FrameRing {
    /// 在途帧的数量 N，由 surface 要求的最少 image 数量决定
    #[inline]
    pub fn fif_count_for(capabilities: &GfxSurfaceCapabilities) -> usize {
        capabilities.min_image_count.max(1) as usize
    }

    /// 创建 N 个 slot，任何一个资源创建失败都会释放已经创建的部分
    pub fn new(
        device: &dyn GfxDevice,
        fif_count: usize,
        target_format: vk::Format,
        fence_timeout_ns: u64,
    ) -> RendererResult<Self> {
        let mut ring = Self {
            slots: Vec::with_capacity(fif_count),
            counter: FrameCounter::new(0, fif_count),
            query_pool: None,
            target_format,
            target_extent: vk::Extent2D::default(),
            targets_initialized: false,
            clear_previous: true,
            fence_timeout_ns,
        };
        if let Err(err) = ring.init_slots(device, fif_count) {
            ring.destroy(device);
            return Err(err);
        }
        log::info!("frame ring created with {} slots", fif_count);
        Ok(ring)
    }

    fn init_slots(&mut self, device: &dyn GfxDevice, fif_count: usize) -> RendererResult<()> {
        self.query_pool =
            Some(device.create_query_pool(fif_count as u32 * 2, "frame-timestamps").creating("query pool")?);

        for i in 0..fif_count {
            let label = (b'A' + (i % 26) as u8) as char;
            let command_buffer =
                device.allocate_command_buffers(1, &format!("frame-{label}")).creating("frame command buffer")?[0];
            let fence = match device.create_fence(true, &format!("frame-{label}-fence")).creating("frame fence") {
                Ok(fence) => fence,
                Err(err) => {
                    device.free_command_buffers(&[command_buffer]);
                    return Err(err);
                }
            };
            let image_available =
                match device.create_semaphore(&format!("frame-{label}-image-available")).creating("frame semaphore") {
                    Ok(semaphore) => semaphore,
                    Err(err) => {
                        device.free_command_buffers(&[command_buffer]);
                        device.destroy_fence(fence);
                        return Err(err);
                    }
                };
            let sets = match device
                .allocate_descriptor_sets(&[GfxDescriptorSetLayout::Display, GfxDescriptorSetLayout::Render])
                .creating("frame descriptor sets")
            {
                Ok(sets) => sets,
                Err(err) => {
                    device.free_command_buffers(&[command_buffer]);
                    device.destroy_fence(fence);
                    device.destroy_semaphore(image_available);
                    return Err(err);
                }
            };

            self.slots.push(FrameSlot {
                command_buffer,
                fence,
                image_available,
                display_set: sets[0],
                render_set: sets[1],
                render_target: None,
                timestamp_pending: false,
            });
        }
        Ok(())
    }
}

// getters
impl FrameRing {
    #[inline]
    pub fn fif_count(&self) -> usize {
        self.counter.fif_count()
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.counter.frame_id()
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        self.counter.frame_name()
    }

    #[inline]
    pub fn current_index(&self) -> usize {
        self.counter.frame_index()
    }

    #[inline]
    pub fn previous_index(&self) -> usize {
        self.counter.previous_frame_index()
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    #[inline]
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current_index()]
    }

    #[inline]
    pub fn previous(&self) -> &FrameSlot {
        &self.slots[self.previous_index()]
    }

    #[inline]
    pub fn query_pool(&self) -> Option<GfxQueryPoolHandle> {
        self.query_pool
    }

    #[inline]
    pub fn target_extent(&self) -> vk::Extent2D {
        self.target_extent
    }

    #[inline]
    pub fn target_format(&self) -> vk::Format {
        self.target_format
    }

    #[inline]
    pub fn has_render_targets(&self) -> bool {
        self.slots.iter().all(|slot| slot.render_target.is_some()) && !self.slots.is_empty()
    }

    #[inline]
    pub fn targets_initialized(&self) -> bool {
        self.targets_initialized
    }

    /// slot 的 timestamp query 起始序号
    #[inline]
    pub fn query_index(index: usize) -> u32 {
        index as u32 * 2
    }
}

// update
impl FrameRing {
    /// 等待当前 slot 的 fence，然后将其 reset
    pub fn acquire_slot(&mut self, device: &dyn GfxDevice) -> RendererResult<usize> {
        let _span = tracy_client::span!("FrameRing::acquire_slot");
        let index = self.current_index();
        let fence = self.slots[index].fence;
        device.wait_for_fence(fence, self.fence_timeout_ns)?;
        device.reset_fence(fence)?;
        Ok(index)
    }

    /// 放弃当前帧：fence 已经被 reset 却没有被提交，替换成一个 signaled 的 fence
    ///
    /// `image_acquired` 表示 image available semaphore 已经被 acquire signal 却不会被等待，同样需要替换
    pub fn recover_slot(&mut self, device: &dyn GfxDevice, image_acquired: bool) -> RendererResult<()> {
        let index = self.current_index();
        let label = self.counter.frame_label();

        let fence = device.create_fence(true, &format!("frame-{label}-fence"))?;
        let old = std::mem::replace(&mut self.slots[index].fence, fence);
        device.destroy_fence(old);

        if image_acquired {
            device.wait_idle()?;
            let semaphore = device.create_semaphore(&format!("frame-{label}-image-available"))?;
            let old = std::mem::replace(&mut self.slots[index].image_available, semaphore);
            device.destroy_semaphore(old);
        }

        self.slots[index].timestamp_pending = false;
        Ok(())
    }

    /// 不论这一帧是否成功，都前进到下一个 slot
    #[inline]
    pub fn release_slot(&mut self) {
        self.counter.next_frame();
    }

    #[inline]
    pub fn set_timestamp_pending(&mut self, index: usize, pending: bool) {
        self.slots[index].timestamp_pending = pending;
    }

    /// 累积渲染被重置，下一帧清空历史
    #[inline]
    pub fn request_clear_previous(&mut self) {
        self.clear_previous = true;
    }

    /// 录制命令时调用：返回是否需要清空上一个 slot 的 render target 以及 render target 是否已经初始化过，
    /// 之后两个状态都被消耗掉
    pub fn take_target_state(&mut self) -> (bool, bool) {
        let state = (self.clear_previous, self.targets_initialized);
        self.clear_previous = false;
        self.targets_initialized = true;
        state
    }

    /// 录制的命令没有被提交，把 [`Self::take_target_state`] 取走的状态还回去
    pub fn restore_target_state(&mut self, (clear_previous, targets_initialized): (bool, bool)) {
        self.clear_previous |= clear_previous;
        self.targets_initialized &= targets_initialized;
    }

    /// 读取 `index` 上一次提交的 GPU 时间，会等待查询结果可用
    ///
    /// 没有可用的结果时返回负数
    pub fn read_gpu_time(&mut self, device: &dyn GfxDevice, index: usize) -> f64 {
        let Some(pool) = self.query_pool else {
            return -1.0;
        };
        if !self.slots[index].timestamp_pending {
            return -1.0;
        }
        self.slots[index].timestamp_pending = false;
        match device.query_time_elapsed(pool, Self::query_index(index), true) {
            Ok(Some(ms)) => ms,
            Ok(None) => -1.0,
            Err(err) => {
                log::warn!("failed to read frame timestamps: {}", err);
                -1.0
            }
        }
    }

    /// 尺寸变化时重建全部 render target，并重写它们的 descriptor
    ///
    /// 返回是否进行了重建。重建之后需要重置累积渲染。
    pub fn ensure_render_targets(&mut self, device: &dyn GfxDevice, extent: vk::Extent2D) -> RendererResult<bool> {
        if self.has_render_targets() && self.target_extent == extent {
            return Ok(false);
        }
        let _span = tracy_client::span!("FrameRing::ensure_render_targets");

        if self.slots.iter().any(|slot| slot.render_target.is_some()) {
            device.wait_idle()?;
            self.release_render_targets(device);
        }

        for i in 0..self.slots.len() {
            let image = device.create_image(&GfxImageCreateInfo {
                extent,
                format: self.target_format,
                usage: vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
                debug_name: format!("render-target-{i}"),
            });
            match image.creating("render target") {
                Ok(image) => self.slots[i].render_target = Some(image),
                Err(err) => {
                    self.release_render_targets(device);
                    return Err(err);
                }
            }
        }

        let count = self.slots.len();
        let mut writes = Vec::with_capacity(count * 3);
        for (i, slot) in self.slots.iter().enumerate() {
            let (Some(target), Some(previous)) = (slot.render_target, self.slots[(i + count - 1) % count].render_target)
            else {
                continue;
            };
            writes.push(GfxDescriptorWrite::new(
                slot.display_set,
                binding::DISPLAY_BUFFER,
                GfxDescriptorResource::SampledImage {
                    image: target,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            ));
            writes.push(GfxDescriptorWrite::new(
                slot.render_set,
                binding::RENDER_BUFFER,
                GfxDescriptorResource::StorageImage {
                    image: target,
                    layout: vk::ImageLayout::GENERAL,
                },
            ));
            writes.push(GfxDescriptorWrite::new(
                slot.render_set,
                binding::PREV_RENDER_BUFFER,
                GfxDescriptorResource::StorageImage {
                    image: previous,
                    layout: vk::ImageLayout::GENERAL,
                },
            ));
        }
        device.write_descriptors(&writes);

        log::info!("render targets created: {}x{} {:?}", extent.width, extent.height, self.target_format);
        self.target_extent = extent;
        self.targets_initialized = false;
        self.clear_previous = true;
        Ok(true)
    }

    /// 每个 ready 的帧写入当前 slot 的场景绑定
    pub fn refresh_scene_bindings(&self, device: &dyn GfxDevice, bindings: &SceneBindings) {
        let set = self.current().render_set;
        let mut writes = Vec::with_capacity(4);
        if let Some(tlas) = bindings.tlas {
            writes.push(GfxDescriptorWrite::new(set, binding::TLAS, GfxDescriptorResource::Acceleration(tlas)));
        }
        let buffers = [
            (binding::INSTANCES, bindings.instances),
            (binding::MATERIALS, bindings.materials),
            (binding::EMITTERS, bindings.emitters),
        ];
        for (binding, buffer) in buffers {
            if let Some(buffer) = buffer {
                writes.push(GfxDescriptorWrite::new(set, binding, GfxDescriptorResource::StorageBuffer(buffer)));
            }
        }
        device.write_descriptors(&writes);
    }
}

// destroy
impl FrameRing {
    /// 调用方需要保证设备已经 idle
    pub fn release_render_targets(&mut self, device: &dyn GfxDevice) {
        for slot in &mut self.slots {
            if let Some(image) = slot.render_target.take() {
                device.destroy_image(image);
            }
        }
        self.target_extent = vk::Extent2D::default();
        self.targets_initialized = false;
    }

    /// 调用方需要保证设备已经 idle
    pub fn destroy(&mut self, device: &dyn GfxDevice) {
        self.release_render_targets(device);
        for slot in self.slots.drain(..) {
            device.free_command_buffers(&[slot.command_buffer]);
            device.destroy_fence(slot.fence);
            device.destroy_semaphore(slot.image_available);
            device.free_descriptor_sets(&[slot.display_set, slot.render_set]);
        }
        if let Some(pool) = self.query_pool.take() {
            device.destroy_query_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::null_device::{GfxCall, NullDevice, NullFailure};

    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 16,
        height: 16,
    };

    fn ring(device: &NullDevice, n: usize) -> FrameRing {
        FrameRing::new(device, n, vk::Format::R32G32B32A32_SFLOAT, 1_000_000).unwrap()
    }

    #[test]
    fn previous_slot_binding_wraps() {
        let device = NullDevice::new();
        let mut ring = ring(&device, 3);
        assert!(ring.ensure_render_targets(&device, EXTENT).unwrap());
        assert!(!ring.ensure_render_targets(&device, EXTENT).unwrap());

        assert_eq!(ring.previous_index(), 2);
        let last_target = ring.slot(2).render_target.unwrap();
        assert_eq!(
            device.descriptor_binding(ring.slot(0).render_set, binding::PREV_RENDER_BUFFER),
            Some(GfxDescriptorResource::StorageImage {
                image: last_target,
                layout: vk::ImageLayout::GENERAL,
            })
        );
    }

    #[test]
    fn take_target_state_is_one_shot() {
        let device = NullDevice::new();
        let mut ring = ring(&device, 2);
        ring.ensure_render_targets(&device, EXTENT).unwrap();

        assert_eq!(ring.take_target_state(), (true, false));
        assert_eq!(ring.take_target_state(), (false, true));
        ring.request_clear_previous();
        assert_eq!(ring.take_target_state(), (true, true));

        // 尺寸变化后需要重新初始化
        ring.ensure_render_targets(&device, vk::Extent2D { width: 8, height: 8 }).unwrap();
        assert_eq!(ring.take_target_state(), (true, false));
        assert_eq!(device.live_images(), 2);

        // 没有提交的录制不消耗状态
        ring.restore_target_state((true, false));
        assert_eq!(ring.take_target_state(), (true, false));
    }

    #[test]
    fn failed_creation_releases_everything() {
        let device = NullDevice::new();
        let mut ring = ring(&device, 3);
        device.inject_failure(NullFailure::CreateImage, 1);
        assert!(ring.ensure_render_targets(&device, EXTENT).is_err());
        assert_eq!(device.live_images(), 0);
        assert!(!ring.has_render_targets());

        ring.destroy(&device);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_descriptor_sets(), 0);
        assert_eq!(device.live_query_pools(), 0);
    }

    #[test]
    fn acquire_waits_before_reset() {
        let device = NullDevice::new();
        let mut ring = ring(&device, 2);
        let index = ring.acquire_slot(&device).unwrap();
        let fence = ring.slot(index).fence;

        let calls = device.calls();
        let wait = calls.iter().position(|c| *c == GfxCall::WaitFence(fence)).unwrap();
        let reset = calls.iter().position(|c| *c == GfxCall::ResetFence(fence)).unwrap();
        assert!(wait < reset);

        // 没有提交就再次等待会超时，恢复之后可以继续使用
        assert!(ring.acquire_slot(&device).is_err());
        let semaphore = ring.slot(index).image_available;
        ring.recover_slot(&device, true).unwrap();
        assert!(ring.acquire_slot(&device).is_ok());
        assert_eq!(device.live_fences(), 2);
        assert_eq!(device.live_semaphores(), 2);
        assert_ne!(ring.slot(index).image_available, semaphore);
    }
}

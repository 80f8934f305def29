//! 不依赖 GPU 的设备实现
//!
//! 所有对象都保存在内存中的 slotmap 里，每次调用都会记入 [`GfxCall`] 日志。
//! 提交的命令在 submit 时立即生效，但 fence 与 timestamp query 的结果要等到
//! 该次提交被视为完成（等待 fence、`wait_idle`、或带 wait 的 query）之后才可见，
//! 以此模拟 GPU 与 CPU 之间的异步关系。

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::{
    commands::{command::GfxCommand, submit_info::GfxSubmitInfo},
    descriptors::{GfxDescriptorResource, GfxDescriptorSetLayout, GfxDescriptorWrite, ResourceClass},
    device::{
        GfxBlasGeometry, GfxBufferCreateInfo, GfxDevice, GfxImageCreateInfo, GfxPipelineCreateInfo, GfxTlasInstance,
    },
    error::{GfxError, GfxResult},
    handles::*,
    swapchain::{
        GfxAcquireResult, GfxPresentResult, GfxSurfaceCapabilities, GfxSwapchainCreateInfo, is_empty_extent,
    },
};

/// 设备调用日志
#[derive(Clone, Debug, PartialEq)]
pub enum GfxCall {
    CreateImage { image: GfxImageHandle, extent: vk::Extent2D },
    DestroyImage(GfxImageHandle),
    CreateBuffer(GfxBufferHandle),
    DestroyBuffer(GfxBufferHandle),
    WaitFence(GfxFenceHandle),
    ResetFence(GfxFenceHandle),
    RecordCommands {
        command_buffer: GfxCommandBufferHandle,
        commands: Vec<GfxCommand>,
    },
    Submit {
        command_buffers: Vec<GfxCommandBufferHandle>,
        wait_semaphores: Vec<GfxSemaphoreHandle>,
        signal_semaphores: Vec<GfxSemaphoreHandle>,
        fence: Option<GfxFenceHandle>,
    },
    WaitIdle,
    WriteDescriptors(Vec<GfxDescriptorWrite>),
    BuildBlas(GfxAccelerationHandle),
    BuildTlas { tlas: GfxAccelerationHandle, instance_count: usize },
    DestroyAcceleration(GfxAccelerationHandle),
    CreateSwapchain {
        swapchain: GfxSwapchainHandle,
        extent: vk::Extent2D,
        old_swapchain: Option<GfxSwapchainHandle>,
    },
    DestroySwapchain(GfxSwapchainHandle),
    Acquire { swapchain: GfxSwapchainHandle, result: GfxAcquireResult },
    Present { swapchain: GfxSwapchainHandle, image_index: u32 },
}

/// 可以注入失败的调用
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NullFailure {
    CreateImage,
    CreateBuffer,
    /// 等待 fence 超时
    WaitFence,
    /// wait_idle 返回 device lost
    WaitIdle,
    RecordCommands,
    Submit,
    BuildTlas,
    CreateSwapchain,
    /// acquire 返回 out-of-date
    Acquire,
    /// acquire 成功，但报告 suboptimal
    SuboptimalAcquire,
    /// present 返回 out-of-date
    Present,
}

struct NullImage {
    info: GfxImageCreateInfo,
    /// 图像内容用一个字节概括：clear 写 0，光追写 0x7f，display pass 写 0xff
    fill: u8,
}

struct NullBuffer {
    info: GfxBufferCreateInfo,
    data: Vec<u8>,
}

#[derive(Default, Clone, Copy)]
struct NullQuery {
    value: Option<u64>,
    /// (提交 id, 完成后的值)
    pending: Option<(u64, u64)>,
}

struct NullSubmission {
    id: u64,
    fence: Option<GfxFenceHandle>,
    completed: bool,
}

struct NullSurface {
    capabilities: GfxSurfaceCapabilities,
}

struct NullSwapchain {
    surface: GfxSurfaceHandle,
    extent: vk::Extent2D,
    images: Vec<GfxImageHandle>,
    next_image: u32,
}

struct NullState {
    images: SlotMap<GfxImageHandle, NullImage>,
    buffers: SlotMap<GfxBufferHandle, NullBuffer>,
    fences: SlotMap<GfxFenceHandle, bool>,
    semaphores: SlotMap<GfxSemaphoreHandle, String>,
    command_buffers: SlotMap<GfxCommandBufferHandle, Vec<GfxCommand>>,
    descriptor_sets: SlotMap<GfxDescriptorSetHandle, HashMap<u32, GfxDescriptorResource>>,
    query_pools: SlotMap<GfxQueryPoolHandle, Vec<NullQuery>>,
    pipelines: SlotMap<GfxPipelineHandle, GfxPipelineCreateInfo>,
    accelerations: SlotMap<GfxAccelerationHandle, usize>,
    surfaces: SlotMap<GfxSurfaceHandle, NullSurface>,
    swapchains: SlotMap<GfxSwapchainHandle, NullSwapchain>,

    submissions: Vec<NullSubmission>,
    next_submission_id: u64,
    /// 模拟的 GPU 时钟，单位 ns
    gpu_clock_ns: u64,
    gpu_frame_time_ns: u64,

    failures: HashMap<NullFailure, u32>,
    calls: Vec<GfxCall>,
}

pub struct NullDevice {
    state: Mutex<NullState>,
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl NullDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NullState {
                images: SlotMap::with_key(),
                buffers: SlotMap::with_key(),
                fences: SlotMap::with_key(),
                semaphores: SlotMap::with_key(),
                command_buffers: SlotMap::with_key(),
                descriptor_sets: SlotMap::with_key(),
                query_pools: SlotMap::with_key(),
                pipelines: SlotMap::with_key(),
                accelerations: SlotMap::with_key(),
                surfaces: SlotMap::with_key(),
                swapchains: SlotMap::with_key(),
                submissions: Vec::new(),
                next_submission_id: 0,
                gpu_clock_ns: 0,
                gpu_frame_time_ns: 2_000_000,
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// 创建一个 surface，支持 FIFO 与 MAILBOX，最少 3 张 image
    pub fn create_surface(&self, extent: vk::Extent2D) -> GfxSurfaceHandle {
        self.create_surface_with(GfxSurfaceCapabilities {
            current_extent: extent,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            min_image_count: 3,
            max_image_count: 8,
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        })
    }

    pub fn create_surface_with(&self, capabilities: GfxSurfaceCapabilities) -> GfxSurfaceHandle {
        self.state.lock().surfaces.insert(NullSurface { capabilities })
    }
}

// 测试与无头运行使用的控制接口
impl NullDevice {
    /// 模拟窗口尺寸变化，(0, 0) 表示最小化
    pub fn set_surface_extent(&self, surface: GfxSurfaceHandle, extent: vk::Extent2D) {
        if let Some(surface) = self.state.lock().surfaces.get_mut(surface) {
            surface.capabilities.current_extent = extent;
        }
    }

    /// 之后每次提交在 GPU 上耗费的时间
    pub fn set_gpu_frame_time_ms(&self, ms: f64) {
        self.state.lock().gpu_frame_time_ns = (ms * 1_000_000.0) as u64;
    }

    /// 接下来 `times` 次 `point` 调用失败
    pub fn inject_failure(&self, point: NullFailure, times: u32) {
        *self.state.lock().failures.entry(point).or_default() += times;
    }

    pub fn calls(&self) -> Vec<GfxCall> {
        self.state.lock().calls.clone()
    }

    pub fn recorded_commands(&self, command_buffer: GfxCommandBufferHandle) -> Vec<GfxCommand> {
        self.state.lock().command_buffers.get(command_buffer).cloned().unwrap_or_default()
    }

    pub fn descriptor_binding(&self, set: GfxDescriptorSetHandle, binding: u32) -> Option<GfxDescriptorResource> {
        self.state.lock().descriptor_sets.get(set).and_then(|bindings| bindings.get(&binding).copied())
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.state.lock().descriptor_sets.len()
    }

    pub fn live_accelerations(&self) -> usize {
        self.state.lock().accelerations.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_query_pools(&self) -> usize {
        self.state.lock().query_pools.len()
    }

    pub fn is_acceleration_alive(&self, acceleration: GfxAccelerationHandle) -> bool {
        self.state.lock().accelerations.contains_key(acceleration)
    }
}

// tools
impl NullState {
    fn take_failure(&mut self, point: NullFailure) -> bool {
        match self.failures.get_mut(&point) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    /// 按队列顺序完成直到 `id` 为止的所有提交
    fn complete_submissions_until(&mut self, id: u64) {
        let mut completed = Vec::new();
        for submission in self.submissions.iter_mut().filter(|s| !s.completed && s.id <= id) {
            submission.completed = true;
            completed.push(submission.id);
            if let Some(signaled) = submission.fence.and_then(|fence| self.fences.get_mut(fence)) {
                *signaled = true;
            }
        }
        for queries in self.query_pools.values_mut() {
            for query in queries.iter_mut() {
                match query.pending {
                    Some((submission, value)) if completed.contains(&submission) => {
                        query.value = Some(value);
                        query.pending = None;
                    }
                    _ => {}
                }
            }
        }
        self.submissions.retain(|s| !s.completed);
    }

    fn surface_extent(&self, surface: GfxSurfaceHandle) -> Option<vk::Extent2D> {
        self.surfaces.get(surface).map(|s| s.capabilities.current_extent)
    }

    fn apply_command(&mut self, command: &GfxCommand, submission: u64, timestamps: &mut u32) {
        match command {
            GfxCommand::ResetQueryPool {
                pool,
                first_query,
                query_count,
            } => {
                if let Some(queries) = self.query_pools.get_mut(*pool) {
                    for query in queries.iter_mut().skip(*first_query as usize).take(*query_count as usize) {
                        *query = NullQuery::default();
                    }
                }
            }
            GfxCommand::WriteTimestamp { pool, query, .. } => {
                // 第一个 timestamp 记录开始时间，之后的都记录在一帧的 GPU 时间之后
                let value = if *timestamps == 0 {
                    self.gpu_clock_ns
                } else {
                    self.gpu_clock_ns + self.gpu_frame_time_ns
                };
                *timestamps += 1;
                if let Some(slot) = self.query_pools.get_mut(*pool).and_then(|q| q.get_mut(*query as usize)) {
                    slot.pending = Some((submission, value));
                }
            }
            GfxCommand::ClearColorImage { image, .. } => {
                if let Some(image) = self.images.get_mut(*image) {
                    image.fill = 0;
                }
            }
            GfxCommand::TraceRays { target, .. } => {
                if let Some(image) = self.images.get_mut(*target) {
                    image.fill = 0x7f;
                }
            }
            GfxCommand::DisplayPass { target, .. } => {
                if let Some(image) = self.images.get_mut(*target) {
                    image.fill = 0xff;
                }
            }
            GfxCommand::CopyImageToBuffer { image, buffer, .. } => {
                let fill = self.images.get(*image).map(|image| image.fill).unwrap_or_default();
                if let Some(buffer) = self.buffers.get_mut(*buffer) {
                    buffer.data = vec![fill; buffer.info.size as usize];
                }
            }
            GfxCommand::ImageBarriers(_) | GfxCommand::HostReadBarrier { .. } => {}
        }
    }
}

impl GfxDevice for NullDevice {
    fn create_image(&self, info: &GfxImageCreateInfo) -> GfxResult<GfxImageHandle> {
        let mut state = self.state.lock();
        if state.take_failure(NullFailure::CreateImage) {
            return Err(GfxError::vk("vkCreateImage", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let image = state.images.insert(NullImage {
            info: info.clone(),
            fill: 0,
        });
        state.calls.push(GfxCall::CreateImage {
            image,
            extent: info.extent,
        });
        Ok(image)
    }

    fn destroy_image(&self, image: GfxImageHandle) {
        let mut state = self.state.lock();
        if state.images.remove(image).is_some() {
            state.calls.push(GfxCall::DestroyImage(image));
        }
    }

    fn create_buffer(&self, info: &GfxBufferCreateInfo) -> GfxResult<GfxBufferHandle> {
        let mut state = self.state.lock();
        if state.take_failure(NullFailure::CreateBuffer) {
            return Err(GfxError::vk("vkCreateBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let buffer = state.buffers.insert(NullBuffer {
            info: info.clone(),
            data: vec![0; info.size as usize],
        });
        state.calls.push(GfxCall::CreateBuffer(buffer));
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: GfxBufferHandle) {
        let mut state = self.state.lock();
        if state.buffers.remove(buffer).is_some() {
            state.calls.push(GfxCall::DestroyBuffer(buffer));
        }
    }

    fn read_buffer(&self, buffer: GfxBufferHandle) -> GfxResult<Vec<u8>> {
        let state = self.state.lock();
        let buffer = state.buffers.get(buffer).ok_or(GfxError::InvalidHandle("buffer"))?;
        if !buffer.info.host_visible {
            return Err(GfxError::vk("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        Ok(buffer.data.clone())
    }

    fn create_fence(&self, signaled: bool, _debug_name: &str) -> GfxResult<GfxFenceHandle> {
        Ok(self.state.lock().fences.insert(signaled))
    }

    fn destroy_fence(&self, fence: GfxFenceHandle) {
        self.state.lock().fences.remove(fence);
    }

    fn wait_for_fence(&self, fence: GfxFenceHandle, timeout_ns: u64) -> GfxResult<()> {
        let mut state = self.state.lock();
        state.calls.push(GfxCall::WaitFence(fence));
        let signaled = *state.fences.get(fence).ok_or(GfxError::InvalidHandle("fence"))?;
        if state.take_failure(NullFailure::WaitFence) {
            return Err(GfxError::Timeout { timeout_ns });
        }
        if signaled {
            return Ok(());
        }
        match state.submissions.iter().find(|s| s.fence == Some(fence)).map(|s| s.id) {
            Some(id) => {
                state.complete_submissions_until(id);
                Ok(())
            }
            // 没有任何提交会 signal 这个 fence，永远等不到
            None => Err(GfxError::Timeout { timeout_ns }),
        }
    }

    fn reset_fence(&self, fence: GfxFenceHandle) -> GfxResult<()> {
        let mut state = self.state.lock();
        let signaled = state.fences.get_mut(fence).ok_or(GfxError::InvalidHandle("fence"))?;
        *signaled = false;
        state.calls.push(GfxCall::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self, debug_name: &str) -> GfxResult<GfxSemaphoreHandle> {
        Ok(self.state.lock().semaphores.insert(debug_name.to_string()))
    }

    fn destroy_semaphore(&self, semaphore: GfxSemaphoreHandle) {
        self.state.lock().semaphores.remove(semaphore);
    }

    fn allocate_command_buffers(&self, count: usize, _debug_name: &str) -> GfxResult<Vec<GfxCommandBufferHandle>> {
        let mut state = self.state.lock();
        Ok((0..count).map(|_| state.command_buffers.insert(Vec::new())).collect())
    }

    fn free_command_buffers(&self, command_buffers: &[GfxCommandBufferHandle]) {
        let mut state = self.state.lock();
        for cmd in command_buffers {
            state.command_buffers.remove(*cmd);
        }
    }

    fn record_commands(&self, command_buffer: GfxCommandBufferHandle, commands: &[GfxCommand]) -> GfxResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(NullFailure::RecordCommands) {
            return Err(GfxError::vk("vkEndCommandBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let recorded = state.command_buffers.get_mut(command_buffer).ok_or(GfxError::InvalidHandle("command buffer"))?;
        *recorded = commands.to_vec();
        state.calls.push(GfxCall::RecordCommands {
            command_buffer,
            commands: commands.to_vec(),
        });
        Ok(())
    }

    fn submit(&self, submit_info: &GfxSubmitInfo, fence: Option<GfxFenceHandle>) -> GfxResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(NullFailure::Submit) {
            return Err(GfxError::vk("vkQueueSubmit2", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        if let Some(fence) = fence {
            let signaled = *state.fences.get(fence).ok_or(GfxError::InvalidHandle("fence"))?;
            let in_flight = state.submissions.iter().any(|s| s.fence == Some(fence));
            // 提交时 fence 必须处于 unsignaled 且没有被其他提交占用
            if signaled || in_flight {
                return Err(GfxError::vk("vkQueueSubmit2", vk::Result::ERROR_VALIDATION_FAILED_EXT));
            }
        }

        let id = state.next_submission_id;
        state.next_submission_id += 1;

        let mut timestamps = 0;
        for cmd in &submit_info.command_buffers {
            let commands = state.command_buffers.get(*cmd).cloned().ok_or(GfxError::InvalidHandle("command buffer"))?;
            for command in &commands {
                state.apply_command(command, id, &mut timestamps);
            }
        }
        let advance = state.gpu_frame_time_ns + 1_000;
        state.gpu_clock_ns += advance;

        state.submissions.push(NullSubmission {
            id,
            fence,
            completed: false,
        });
        state.calls.push(GfxCall::Submit {
            command_buffers: submit_info.command_buffers.clone(),
            wait_semaphores: submit_info.wait_infos.iter().map(|(s, _)| *s).collect(),
            signal_semaphores: submit_info.signal_infos.iter().map(|(s, _)| *s).collect(),
            fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> GfxResult<()> {
        let mut state = self.state.lock();
        state.calls.push(GfxCall::WaitIdle);
        if state.take_failure(NullFailure::WaitIdle) {
            return Err(GfxError::DeviceLost);
        }
        state.complete_submissions_until(u64::MAX);
        Ok(())
    }

    fn allocate_descriptor_sets(&self, layouts: &[GfxDescriptorSetLayout]) -> GfxResult<Vec<GfxDescriptorSetHandle>> {
        let mut state = self.state.lock();
        Ok(layouts.iter().map(|_| state.descriptor_sets.insert(HashMap::new())).collect())
    }

    fn allocate_bindless_set(&self, _class: ResourceClass, _capacity: u32) -> GfxResult<GfxDescriptorSetHandle> {
        Ok(self.state.lock().descriptor_sets.insert(HashMap::new()))
    }

    fn free_descriptor_sets(&self, sets: &[GfxDescriptorSetHandle]) {
        let mut state = self.state.lock();
        for set in sets {
            state.descriptor_sets.remove(*set);
        }
    }

    fn write_descriptors(&self, writes: &[GfxDescriptorWrite]) {
        let mut state = self.state.lock();
        for write in writes {
            match state.descriptor_sets.get_mut(write.set) {
                Some(bindings) => {
                    bindings.insert(write.binding, write.resource);
                }
                None => log::warn!("write to invalid descriptor set, binding {}", write.binding),
            }
        }
        state.calls.push(GfxCall::WriteDescriptors(writes.to_vec()));
    }

    fn create_query_pool(&self, query_count: u32, _debug_name: &str) -> GfxResult<GfxQueryPoolHandle> {
        Ok(self.state.lock().query_pools.insert(vec![NullQuery::default(); query_count as usize]))
    }

    fn destroy_query_pool(&self, pool: GfxQueryPoolHandle) {
        self.state.lock().query_pools.remove(pool);
    }

    fn query_time_elapsed(&self, pool: GfxQueryPoolHandle, first_query: u32, wait: bool) -> GfxResult<Option<f64>> {
        let mut state = self.state.lock();
        let queries = state.query_pools.get(pool).ok_or(GfxError::InvalidHandle("query pool"))?;
        let (begin, end) = match (queries.get(first_query as usize), queries.get(first_query as usize + 1)) {
            (Some(begin), Some(end)) => (*begin, *end),
            _ => return Ok(None),
        };

        let pending = begin.pending.iter().chain(end.pending.iter()).map(|(id, _)| *id).max();
        if let Some(id) = pending {
            if !wait {
                return Ok(None);
            }
            state.complete_submissions_until(id);
        }

        let queries = state.query_pools.get(pool).ok_or(GfxError::InvalidHandle("query pool"))?;
        match (queries[first_query as usize].value, queries[first_query as usize + 1].value) {
            (Some(begin), Some(end)) => Ok(Some(end.saturating_sub(begin) as f64 / 1_000_000.0)),
            _ => Ok(None),
        }
    }

    fn create_pipeline(&self, info: &GfxPipelineCreateInfo) -> GfxResult<GfxPipelineHandle> {
        Ok(self.state.lock().pipelines.insert(info.clone()))
    }

    fn destroy_pipeline(&self, pipeline: GfxPipelineHandle) {
        self.state.lock().pipelines.remove(pipeline);
    }

    fn build_blas(&self, geometry: &GfxBlasGeometry, _debug_name: &str) -> GfxResult<GfxAccelerationHandle> {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(geometry.vertex_buffer) || !state.buffers.contains_key(geometry.index_buffer) {
            return Err(GfxError::InvalidHandle("geometry buffer"));
        }
        let blas = state.accelerations.insert(0);
        state.calls.push(GfxCall::BuildBlas(blas));
        Ok(blas)
    }

    fn build_tlas(&self, instances: &[GfxTlasInstance], _debug_name: &str) -> GfxResult<GfxAccelerationHandle> {
        let mut state = self.state.lock();
        if state.take_failure(NullFailure::BuildTlas) {
            return Err(GfxError::vk("vkCmdBuildAccelerationStructuresKHR", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        if let Some(invalid) = instances.iter().find(|i| !state.accelerations.contains_key(i.blas)) {
            log::error!("tlas instance {} references a destroyed blas", invalid.custom_index);
            return Err(GfxError::InvalidHandle("blas"));
        }
        let tlas = state.accelerations.insert(instances.len());
        state.calls.push(GfxCall::BuildTlas {
            tlas,
            instance_count: instances.len(),
        });
        Ok(tlas)
    }

    fn destroy_acceleration(&self, acceleration: GfxAccelerationHandle) {
        let mut state = self.state.lock();
        if state.accelerations.remove(acceleration).is_some() {
            state.calls.push(GfxCall::DestroyAcceleration(acceleration));
        }
    }

    fn surface_capabilities(&self, surface: GfxSurfaceHandle) -> GfxResult<GfxSurfaceCapabilities> {
        let state = self.state.lock();
        state.surfaces.get(surface).map(|s| s.capabilities.clone()).ok_or(GfxError::InvalidHandle("surface"))
    }

    fn create_swapchain(
        &self,
        info: &GfxSwapchainCreateInfo,
        old_swapchain: Option<GfxSwapchainHandle>,
    ) -> GfxResult<GfxSwapchainHandle> {
        let mut state = self.state.lock();
        if state.take_failure(NullFailure::CreateSwapchain) {
            return Err(GfxError::vk("vkCreateSwapchainKHR", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        if !state.surfaces.contains_key(info.surface) {
            return Err(GfxError::InvalidHandle("surface"));
        }
        if is_empty_extent(info.extent) {
            return Err(GfxError::vk("vkCreateSwapchainKHR", vk::Result::ERROR_INITIALIZATION_FAILED));
        }

        let images = (0..info.min_image_count)
            .map(|i| {
                state.images.insert(NullImage {
                    info: GfxImageCreateInfo {
                        extent: info.extent,
                        format: info.format.format,
                        usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                        debug_name: format!("swapchain-image-{i}"),
                    },
                    fill: 0,
                })
            })
            .collect();
        let swapchain = state.swapchains.insert(NullSwapchain {
            surface: info.surface,
            extent: info.extent,
            images,
            next_image: 0,
        });
        state.calls.push(GfxCall::CreateSwapchain {
            swapchain,
            extent: info.extent,
            old_swapchain,
        });
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: GfxSwapchainHandle) {
        let mut state = self.state.lock();
        if let Some(removed) = state.swapchains.remove(swapchain) {
            for image in removed.images {
                state.images.remove(image);
            }
            state.calls.push(GfxCall::DestroySwapchain(swapchain));
        }
    }

    fn swapchain_images(&self, swapchain: GfxSwapchainHandle) -> GfxResult<Vec<GfxImageHandle>> {
        let state = self.state.lock();
        state.swapchains.get(swapchain).map(|s| s.images.clone()).ok_or(GfxError::InvalidHandle("swapchain"))
    }

    fn acquire_next_image(
        &self,
        swapchain: GfxSwapchainHandle,
        _semaphore: GfxSemaphoreHandle,
        _timeout_ns: u64,
    ) -> GfxResult<GfxAcquireResult> {
        let mut state = self.state.lock();
        let forced_out_of_date = state.take_failure(NullFailure::Acquire);
        let forced_suboptimal = state.take_failure(NullFailure::SuboptimalAcquire);
        let (surface, extent) = {
            let swapchain = state.swapchains.get(swapchain).ok_or(GfxError::InvalidHandle("swapchain"))?;
            (swapchain.surface, swapchain.extent)
        };
        let surface_extent = state.surface_extent(surface).unwrap_or_default();

        let result = if forced_out_of_date || is_empty_extent(surface_extent) {
            GfxAcquireResult::OutOfDate
        } else {
            let swapchain = state.swapchains.get_mut(swapchain).ok_or(GfxError::InvalidHandle("swapchain"))?;
            let image_index = swapchain.next_image;
            swapchain.next_image = (swapchain.next_image + 1) % swapchain.images.len() as u32;
            GfxAcquireResult::Acquired {
                image_index,
                suboptimal: forced_suboptimal || surface_extent != extent,
            }
        };
        state.calls.push(GfxCall::Acquire { swapchain, result });
        Ok(result)
    }

    fn present(
        &self,
        swapchain: GfxSwapchainHandle,
        image_index: u32,
        _wait_semaphores: &[GfxSemaphoreHandle],
    ) -> GfxResult<GfxPresentResult> {
        let mut state = self.state.lock();
        let (surface, extent) = {
            let swapchain = state.swapchains.get(swapchain).ok_or(GfxError::InvalidHandle("swapchain"))?;
            (swapchain.surface, swapchain.extent)
        };
        state.calls.push(GfxCall::Present { swapchain, image_index });
        if state.take_failure(NullFailure::Present) {
            return Ok(GfxPresentResult::OutOfDate);
        }
        let surface_extent = state.surface_extent(surface).unwrap_or_default();
        Ok(GfxPresentResult::Presented {
            suboptimal: surface_extent != extent,
        })
    }
}

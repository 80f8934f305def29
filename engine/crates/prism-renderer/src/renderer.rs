//! 帧调度
//!
//! 外部以固定的节奏调用 [`Renderer::tick`]：
//! 1. 取走脏标记，构建并执行这一帧的 job graph
//! 2. 等待 ring slot、录制命令、提交、呈现、前进 ring、统计时间
//!
//! surface 可能在其他线程被替换，帧调度在整个帧内持有 surface 的可升级读锁，
//! 只有在重建 swapchain 时升级为写锁。

use std::{sync::Arc, time::Instant};

use ash::vk;
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use prism_gfx::{
    commands::{
        barrier::GfxImageBarrier, encoder::GfxCommandEncoder, image_state::GfxImageState, submit_info::GfxSubmitInfo,
    },
    descriptors::{DescriptorManager, ResourceClass},
    device::{GfxDevice, GfxPipelineCreateInfo},
    handles::{GfxImageHandle, GfxPipelineHandle, GfxSurfaceHandle},
    swapchain::{GfxAcquireResult, GfxPresentResult},
};
use prism_scene::{
    camera::CameraManager,
    dirty::{DirtySet, DirtyTracker},
    params::{DisplayParameters, RenderParameters},
    scene_manager::SceneManager,
    settings::RenderSettings,
};

use crate::{
    config::RendererConfig,
    error::{CreationContext, RendererError, RendererResult},
    frame_ring::{FrameRing, SceneBindings},
    jobs::{
        job::JobContext,
        job_graph::{JobGraph, JobReport, build_frame_jobs},
    },
    readback::{ImageData, RenderImage, read_image},
    retired::RetiredResources,
    swapchain_manager::{SwapchainChange, SwapchainManager},
    timing::{TimingAggregator, TimingSnapshot},
    tlas::TlasBuilder,
};

const RAY_TRACING_STAGES: [&str; 5] =
    ["pathtrace.rgen", "pathtrace.rmiss", "shadow.rmiss", "pathtrace.rchit", "shadow.rahit"];

pub struct RendererCreateInfo {
    pub config: RendererConfig,
    pub device: Arc<dyn GfxDevice>,
    pub surface: Option<GfxSurfaceHandle>,
    pub scene: Box<dyn SceneManager>,
    pub descriptor_manager: Box<dyn DescriptorManager>,
    pub settings: Option<Arc<dyn RenderSettings>>,
}

/// 一帧的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// 已提交，但是没有 swapchain image 可以呈现
    RenderedWithoutPresent,
    /// 出现错误，这一帧被放弃
    Abandoned,
    /// 还没有 render target，什么也没有录制
    Skipped,
    /// surface 已被释放
    NoSurface,
}

/// 与 surface 相关、可能被其他线程替换的状态
struct PresentState {
    surface: Option<GfxSurfaceHandle>,
    swapchain: Option<SwapchainManager>,
    /// 最近一次 display pass 写入并成功提交的 swapchain image
    last_present_image: Option<GfxImageHandle>,
}

/// 在其他线程替换 surface
#[derive(Clone)]
pub struct SurfaceHost {
    device: Arc<dyn GfxDevice>,
    present: Arc<RwLock<PresentState>>,
}

impl SurfaceHost {
    /// 释放当前的 swapchain 并换成新的 surface，None 表示 surface 已经不可用
    ///
    /// 先等待设备 idle，再销毁任何 swapchain 相关资源
    pub fn set_surface(&self, surface: Option<GfxSurfaceHandle>) {
        let mut state = self.present.write();
        if let Err(err) = self.device.wait_idle() {
            log::warn!("wait idle before surface replacement failed: {}", err);
        }
        if let Some(mut swapchain) = state.swapchain.take() {
            swapchain.destroy(self.device.as_ref());
        }
        state.last_present_image = None;
        state.surface = surface;
        log::info!("window surface replaced, surface available: {}", surface.is_some());
    }

    pub fn surface(&self) -> Option<GfxSurfaceHandle> {
        self.present.read().surface
    }
}

/// 可以在其他线程读取的帧时间统计
#[derive(Clone)]
pub struct StatisticsHandle {
    timing: Arc<RwLock<TimingAggregator>>,
}

impl StatisticsHandle {
    #[inline]
    pub fn snapshot(&self) -> TimingSnapshot {
        self.timing.read().snapshot()
    }
}

pub struct Renderer {
    config: RendererConfig,
    device: Arc<dyn GfxDevice>,
    scene: Box<dyn SceneManager>,
    descriptor_manager: Box<dyn DescriptorManager>,
    settings: Option<Arc<dyn RenderSettings>>,

    dirty: DirtyTracker,
    camera: CameraManager,
    tlas_builder: TlasBuilder,
    retired: RetiredResources,

    ring: FrameRing,
    present: Arc<RwLock<PresentState>>,
    /// acquire 或 present 报告 swapchain 需要重建
    resize_requested: bool,

    render_pipeline: GfxPipelineHandle,
    display_pipeline: GfxPipelineHandle,

    render_params: RenderParameters,
    display_params: DisplayParameters,
    /// 自上次重置累积以来光追的次数
    frame_number: u32,
    last_render_target: Option<GfxImageHandle>,

    timing: Arc<RwLock<TimingAggregator>>,

    destroyed: bool,
}

// new & init
impl Renderer {
    /// 任何一步失败都会释放已经创建的资源
    pub fn new(create_info: RendererCreateInfo) -> RendererResult<Self> {
        let RendererCreateInfo {
            config,
            device,
            surface,
            scene,
            mut descriptor_manager,
            settings,
        } = create_info;
        let surface = surface.ok_or(RendererError::NoSurface)?;
        let gfx = device.as_ref();

        let capabilities = gfx.surface_capabilities(surface).creating("surface capabilities")?;
        let fif_count = FrameRing::fif_count_for(&capabilities);
        log::info!("frames in flight: {}", fif_count);

        for class in ResourceClass::ALL {
            if let Err(err) = descriptor_manager.create_descriptor_pool(gfx, class, config.descriptor_pool_capacity) {
                descriptor_manager.destroy_all_descriptor_pools(gfx);
                return Err(RendererError::ResourceCreation {
                    what: "descriptor pool",
                    source: err,
                });
            }
        }

        let mut swapchain = match SwapchainManager::new(gfx, surface, config.enable_vsync, config.fallback_extent()) {
            Ok(swapchain) => swapchain,
            Err(err) => {
                descriptor_manager.destroy_all_descriptor_pools(gfx);
                return Err(err);
            }
        };

        let (render_pipeline, display_pipeline) =
            match Self::create_pipelines(gfx, &config, swapchain.format().format) {
                Ok(pipelines) => pipelines,
                Err(err) => {
                    swapchain.destroy(gfx);
                    descriptor_manager.destroy_all_descriptor_pools(gfx);
                    return Err(err);
                }
            };

        let destroy_partial = |swapchain: &mut SwapchainManager, descriptor_manager: &mut Box<dyn DescriptorManager>| {
            gfx.destroy_pipeline(render_pipeline);
            gfx.destroy_pipeline(display_pipeline);
            swapchain.destroy(gfx);
            descriptor_manager.destroy_all_descriptor_pools(gfx);
        };

        let mut ring = match FrameRing::new(
            gfx,
            fif_count,
            config.render_target_format.vk_format(),
            config.fence_timeout_ns(),
        ) {
            Ok(ring) => ring,
            Err(err) => {
                destroy_partial(&mut swapchain, &mut descriptor_manager);
                return Err(err);
            }
        };

        if swapchain.has_swapchain()
            && let Err(err) = ring.ensure_render_targets(gfx, swapchain.extent())
        {
            ring.destroy(gfx);
            destroy_partial(&mut swapchain, &mut descriptor_manager);
            return Err(err);
        }

        let timing = Arc::new(RwLock::new(TimingAggregator::new(config.timing_window)));
        let present = Arc::new(RwLock::new(PresentState {
            surface: Some(surface),
            swapchain: Some(swapchain),
            last_present_image: None,
        }));

        log::info!("renderer initialized");
        Ok(Self {
            retired: RetiredResources::new(fif_count),
            config,
            device,
            scene,
            descriptor_manager,
            settings,
            dirty: DirtyTracker::new(),
            camera: CameraManager::default(),
            tlas_builder: TlasBuilder::default(),
            ring,
            present,
            resize_requested: false,
            render_pipeline,
            display_pipeline,
            render_params: RenderParameters::default(),
            display_params: DisplayParameters::default(),
            frame_number: 0,
            last_render_target: None,
            timing,
            destroyed: false,
        })
    }

    fn create_pipelines(
        device: &dyn GfxDevice,
        config: &RendererConfig,
        color_format: vk::Format,
    ) -> RendererResult<(GfxPipelineHandle, GfxPipelineHandle)> {
        let render_pipeline = device
            .create_pipeline(&GfxPipelineCreateInfo::RayTracing {
                shader_stages: RAY_TRACING_STAGES.to_vec(),
                max_recursion_depth: config.max_recursion_depth,
                bindless_classes: ResourceClass::ALL.to_vec(),
                push_constant_size: size_of::<RenderParameters>() as u32,
            })
            .creating("ray tracing pipeline")?;
        let display_pipeline = device.create_pipeline(&GfxPipelineCreateInfo::Display {
            color_format,
            push_constant_size: size_of::<DisplayParameters>() as u32,
        });
        match display_pipeline.creating("display pipeline") {
            Ok(display_pipeline) => Ok((render_pipeline, display_pipeline)),
            Err(err) => {
                device.destroy_pipeline(render_pipeline);
                Err(err)
            }
        }
    }
}

// getters
impl Renderer {
    #[inline]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn scene(&self) -> &dyn SceneManager {
        self.scene.as_ref()
    }

    #[inline]
    pub fn scene_mut(&mut self) -> &mut dyn SceneManager {
        self.scene.as_mut()
    }

    #[inline]
    pub fn camera(&self) -> &CameraManager {
        &self.camera
    }

    #[inline]
    pub fn frame_ring(&self) -> &FrameRing {
        &self.ring
    }

    #[inline]
    pub fn dirty_tracker(&self) -> &DirtyTracker {
        &self.dirty
    }

    /// 自上次重置累积以来光追的次数
    #[inline]
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    #[inline]
    pub fn render_parameters(&self) -> &RenderParameters {
        &self.render_params
    }

    #[inline]
    pub fn display_parameters(&self) -> &DisplayParameters {
        &self.display_params
    }

    #[inline]
    pub fn tlas_builder(&self) -> &TlasBuilder {
        &self.tlas_builder
    }

    pub fn surface_host(&self) -> SurfaceHost {
        SurfaceHost {
            device: self.device.clone(),
            present: self.present.clone(),
        }
    }

    pub fn statistics(&self) -> TimingSnapshot {
        self.timing.read().snapshot()
    }

    pub fn statistics_handle(&self) -> StatisticsHandle {
        StatisticsHandle {
            timing: self.timing.clone(),
        }
    }

    /// 当前的 swapchain 尺寸，没有 swapchain 时为 None
    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        let state = self.present.read();
        state.swapchain.as_ref().filter(|swapchain| swapchain.has_swapchain()).map(|swapchain| swapchain.extent())
    }
}

// update
impl Renderer {
    /// 报告数据的变化，在下一次构建 job graph 时处理
    #[inline]
    pub fn mark_dirty(&self, dirty: DirtySet) {
        self.dirty.mark(dirty);
    }

    /// 一次完整的迭代：更新 job，然后渲染一帧
    pub fn tick(&mut self) -> FrameOutcome {
        let _span = tracy_client::span!("Renderer::tick");
        let jobs = self.jobs_to_execute();
        self.run_jobs(&jobs);
        self.render_frame()
    }

    /// 取走脏标记并构建这一帧的 job graph
    ///
    /// 任何变化都会重置累积渲染
    pub fn jobs_to_execute(&mut self) -> JobGraph {
        let dirty = self.dirty.take();
        if !dirty.is_empty() {
            self.reset_render_progress();
        }
        build_frame_jobs(dirty, self.scene.as_mut(), &mut self.camera, self.settings.as_deref())
    }

    /// 在当前线程执行 job graph
    ///
    /// 失败以及被跳过的 job 会重新标记对应的变化，下一帧重试
    pub fn run_jobs(&mut self, jobs: &JobGraph) -> JobReport {
        let report = jobs.run_all(&mut JobContext {
            device: self.device.as_ref(),
            scene: self.scene.as_mut(),
            camera: &mut self.camera,
            tlas_builder: &mut self.tlas_builder,
            retired: &mut self.retired,
            frame_id: self.ring.frame_id(),
        });
        if report.tlas_failed() {
            log::error!("{} scene tlas unavailable, ray tracing skipped until rebuilt", self.ring.frame_name());
        }

        let retry = report
            .failed
            .iter()
            .map(|(handle, _)| *handle)
            .chain(report.skipped.iter().copied())
            .fold(DirtySet::NONE, |dirty, handle| dirty | jobs.job(handle).kind.requeue(self.scene.as_mut()));
        if !retry.is_empty() {
            log::warn!("{} unfinished jobs retried next frame: {:?}", self.ring.frame_name(), retry);
            self.dirty.mark(retry);
        }
        report
    }

    /// 重置累积渲染：帧号归零，下一帧清空历史，重新开始计时
    pub fn reset_render_progress(&mut self) {
        self.frame_number = 0;
        self.ring.request_clear_previous();
        self.timing.write().reset_progress();
    }

    pub fn render_frame(&mut self) -> FrameOutcome {
        let _span = tracy_client::span!("Renderer::render_frame");

        let present = self.present.clone();
        let mut state = present.upgradable_read();
        let Some(surface) = state.surface else {
            return FrameOutcome::NoSurface;
        };

        state = self.update_swapchain(state, surface);

        if !self.ring.has_render_targets() {
            return FrameOutcome::Skipped;
        }

        let frame_timer = Instant::now();
        let frame_name = self.ring.frame_name();
        let previous_index = self.ring.previous_index();

        if let Err(err) = self.ring.acquire_slot(self.device.as_ref()) {
            log::error!("{} failed to wait for frame fence: {}", frame_name, err);
            self.ring.release_slot();
            return FrameOutcome::Abandoned;
        }

        self.scene.update_retired_resources(self.device.as_ref());

        let ready = self.scene.is_ready_to_render();
        if ready {
            self.begin_render_iteration();
        }

        let (outcome, last_present_image) = self.record_and_submit(state.swapchain.as_ref(), ready);
        if let Some(image) = last_present_image {
            state = {
                let mut write = RwLockUpgradableReadGuard::upgrade(state);
                write.last_present_image = Some(image);
                RwLockWriteGuard::downgrade_to_upgradable(write)
            };
        }
        drop(state);

        self.ring.release_slot();

        // 上一帧的 GPU 时间，第一次读取时会等待其完成
        let gpu_ms = self.ring.read_gpu_time(self.device.as_ref(), previous_index);
        let cpu_ms = frame_timer.elapsed().as_secs_f64() * 1000.0;
        self.timing.write().record_frame(cpu_ms, gpu_ms, ready);

        log::trace!("{} {:?}, cpu {:.3}ms, gpu {:.3}ms", frame_name, outcome, cpu_ms, gpu_ms);
        outcome
    }

    /// 读回最近一次的渲染结果，尚未产生或者读回失败时返回空的 [`ImageData`]
    pub fn grab_image(&self, kind: RenderImage) -> ImageData {
        let _span = tracy_client::span!("Renderer::grab_image");
        let device = self.device.as_ref();
        let timeout_ns = self.config.readback_timeout_ns();

        let result = match kind {
            RenderImage::Hdr => {
                let Some(image) = self.last_render_target else {
                    log::warn!("cannot grab render target: image not ready");
                    return ImageData::default();
                };
                read_image(
                    device,
                    image,
                    GfxImageState::STORAGE_READ_WRITE_RAY_TRACING,
                    self.ring.target_extent(),
                    self.ring.target_format(),
                    timeout_ns,
                )
            }
            RenderImage::FinalLdr => {
                // 读回期间 swapchain 不能被替换
                let state = self.present.read();
                let (Some(image), Some(swapchain)) = (state.last_present_image, state.swapchain.as_ref()) else {
                    log::warn!("cannot grab swapchain: image not ready");
                    return ImageData::default();
                };
                read_image(
                    device,
                    image,
                    GfxImageState::PRESENT,
                    swapchain.extent(),
                    swapchain.format().format,
                    timeout_ns,
                )
            }
        };

        result.unwrap_or_else(|err| {
            log::error!("failed to grab {:?} image: {}", kind, err);
            ImageData::default()
        })
    }
}

// tools
impl Renderer {
    /// 创建缺失的 swapchain，处理尺寸变化；需要修改时临时升级为写锁
    fn update_swapchain<'a>(
        &mut self,
        state: RwLockUpgradableReadGuard<'a, PresentState>,
        surface: GfxSurfaceHandle,
    ) -> RwLockUpgradableReadGuard<'a, PresentState> {
        let device = self.device.as_ref();

        let need_resize = match state.swapchain.as_ref() {
            None => true,
            Some(swapchain) => match swapchain.needs_resize(device, self.resize_requested) {
                Ok(need_resize) => need_resize,
                Err(err) => {
                    log::warn!("failed to query surface extent: {}", err);
                    false
                }
            },
        };
        if !need_resize {
            return state;
        }

        let mut write = RwLockUpgradableReadGuard::upgrade(state);
        let force = std::mem::take(&mut self.resize_requested);
        let change = match write.swapchain.as_mut() {
            Some(swapchain) => swapchain.check_resize(device, force),
            None => {
                match SwapchainManager::new(device, surface, self.config.enable_vsync, self.config.fallback_extent()) {
                    Ok(swapchain) => {
                        let change = if swapchain.has_swapchain() {
                            SwapchainChange::Recreated(swapchain.extent())
                        } else {
                            SwapchainChange::Unchanged
                        };
                        write.swapchain = Some(swapchain);
                        Ok(change)
                    }
                    Err(err) => Err(err),
                }
            }
        };

        match change {
            Ok(SwapchainChange::Recreated(extent)) => {
                write.last_present_image = None;
                match self.ring.ensure_render_targets(device, extent) {
                    Ok(true) => {
                        self.last_render_target = None;
                        self.reset_render_progress();
                    }
                    Ok(false) => {}
                    Err(err) => log::error!("failed to recreate render targets: {}", err),
                }
            }
            Ok(SwapchainChange::Released) => write.last_present_image = None,
            Ok(SwapchainChange::Unchanged) => {}
            Err(err) => log::warn!("failed to resize swapchain: {}", err),
        }

        RwLockWriteGuard::downgrade_to_upgradable(write)
    }

    fn begin_render_iteration(&mut self) {
        if let Some(settings) = &self.settings {
            self.render_params.num_primary_samples = settings.primary_samples();
            self.render_params.num_secondary_samples = settings.secondary_samples();
            self.render_params.min_depth = settings.min_depth();
            self.render_params.max_depth = settings.max_depth();
            self.render_params.direct_radiance_clamp = settings.direct_radiance_clamp();
            self.render_params.indirect_radiance_clamp = settings.indirect_radiance_clamp();
        }

        self.frame_number += 1;
        self.render_params.frame_number = self.frame_number;
        self.render_params.num_emitters = self.scene.num_emitters();

        self.camera.apply_render_parameters(&mut self.render_params);
        self.camera.apply_display_parameters(&mut self.display_params);

        self.ring.refresh_scene_bindings(
            self.device.as_ref(),
            &SceneBindings {
                tlas: self.scene.scene_tlas(),
                instances: self.scene.instance_buffer(),
                materials: self.scene.material_buffer(),
                emitters: self.scene.emitter_buffer(),
            },
        );
    }

    /// 录制并提交当前帧，返回结果以及成功提交的 swapchain image
    fn record_and_submit(
        &mut self,
        swapchain: Option<&SwapchainManager>,
        ready: bool,
    ) -> (FrameOutcome, Option<GfxImageHandle>) {
        let _span = tracy_client::span!("Renderer::record_and_submit");
        let device = self.device.as_ref();
        let frame_name = self.ring.frame_name();

        let current_index = self.ring.current_index();
        let previous_index = self.ring.previous_index();
        let current = self.ring.current();
        let (command_buffer, fence, image_available) = (current.command_buffer, current.fence, current.image_available);
        let (render_set, display_set) = (current.render_set, current.display_set);
        let (Some(query_pool), Some(current_target), Some(previous_target)) =
            (self.ring.query_pool(), current.render_target, self.ring.previous().render_target)
        else {
            log::error!("{} frame resources missing", frame_name);
            return (self.abandon_frame(false), None);
        };
        let target_state = self.ring.take_target_state();
        let (clear_previous, targets_initialized) = target_state;
        let render_extent = self.ring.target_extent();
        let query = FrameRing::query_index(current_index);

        let mut encoder = GfxCommandEncoder::begin(command_buffer, frame_name.clone());
        encoder.reset_query_pool(query_pool, query, 2);
        encoder.write_timestamp(vk::PipelineStageFlags2::TOP_OF_PIPE, query_pool, query);

        if !targets_initialized {
            let barriers = (0..self.ring.fif_count())
                .filter_map(|i| {
                    let target = self.ring.slot(i).render_target?;
                    let dst = if clear_previous && i == previous_index {
                        GfxImageState::TRANSFER_DST
                    } else {
                        GfxImageState::STORAGE_READ_WRITE_RAY_TRACING
                    };
                    Some(GfxImageBarrier::new(target).transition(GfxImageState::UNDEFINED, dst))
                })
                .collect();
            encoder.image_memory_barrier(barriers);
        }
        if clear_previous {
            if targets_initialized {
                encoder.image_memory_barrier(vec![
                    GfxImageBarrier::new(previous_target)
                        .transition(GfxImageState::UNDEFINED, GfxImageState::TRANSFER_DST),
                ]);
            }
            encoder.clear_color_image(previous_target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, [0.0; 4]);
            encoder.image_memory_barrier(vec![
                GfxImageBarrier::new(previous_target)
                    .transition(GfxImageState::TRANSFER_DST, GfxImageState::STORAGE_READ_WRITE_RAY_TRACING),
            ]);
        }

        let mut traced = false;
        if ready {
            let bindless_sets: Option<Vec<_>> =
                ResourceClass::ALL.iter().map(|class| self.descriptor_manager.descriptor_set(*class)).collect();
            match bindless_sets {
                Some(bindless_sets) => {
                    let mut descriptor_sets = Vec::with_capacity(1 + bindless_sets.len());
                    descriptor_sets.push(render_set);
                    descriptor_sets.extend(bindless_sets);
                    encoder.trace_rays(
                        self.render_pipeline,
                        &descriptor_sets,
                        bytemuck::bytes_of(&self.render_params),
                        current_target,
                        render_extent,
                    );
                    traced = true;
                }
                None => log::warn!("{} bindless descriptor sets missing, ray tracing skipped", frame_name),
            }
        }

        encoder.image_memory_barrier(vec![GfxImageBarrier::new(current_target).transition(
            GfxImageState::STORAGE_READ_WRITE_RAY_TRACING,
            GfxImageState::SHADER_READ_FRAGMENT,
        )]);

        // swapchain image 在录制的中途获取，尽量推迟与呈现引擎的同步
        let mut acquired = None;
        if let Some(swapchain) = swapchain {
            match swapchain.acquire(device, image_available, u64::MAX) {
                Some(GfxAcquireResult::Acquired { image_index, .. }) => {
                    if let (Some(image), Some(render_complete)) =
                        (swapchain.image(image_index), swapchain.render_complete(image_index))
                    {
                        acquired = Some((image_index, image, render_complete));
                    }
                }
                Some(GfxAcquireResult::OutOfDate) => self.resize_requested = true,
                None => {}
            }
        }

        if let (Some((_, image, _)), Some(swapchain)) = (acquired, swapchain) {
            encoder.image_memory_barrier(vec![
                GfxImageBarrier::new(image).transition(GfxImageState::UNDEFINED, GfxImageState::COLOR_ATTACHMENT_WRITE),
            ]);
            encoder.display_pass(
                self.display_pipeline,
                display_set,
                bytemuck::bytes_of(&self.display_params),
                image,
                swapchain.extent(),
            );
            encoder.image_memory_barrier(vec![
                GfxImageBarrier::new(image).transition(GfxImageState::COLOR_ATTACHMENT_WRITE, GfxImageState::PRESENT),
            ]);
        }

        encoder.image_memory_barrier(vec![GfxImageBarrier::new(current_target).transition(
            GfxImageState::SHADER_READ_FRAGMENT,
            GfxImageState::STORAGE_READ_WRITE_RAY_TRACING,
        )]);
        encoder.write_timestamp(vk::PipelineStageFlags2::BOTTOM_OF_PIPE, query_pool, query + 1);

        let command_buffer = match encoder.end(device) {
            Ok(command_buffer) => command_buffer,
            Err(err) => {
                log::error!("{} failed to record frame commands: {}", frame_name, err);
                self.ring.restore_target_state(target_state);
                return (self.abandon_frame(acquired.is_some()), None);
            }
        };

        let mut submit_info = GfxSubmitInfo::new(&[command_buffer]);
        if let Some((_, _, render_complete)) = acquired {
            submit_info = submit_info
                .wait(image_available, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .signal(render_complete, vk::PipelineStageFlags2::ALL_COMMANDS);
        }
        if let Err(err) = device.submit(&submit_info, Some(fence)) {
            log::error!("{} failed to submit frame commands: {}", frame_name, err);
            self.ring.restore_target_state(target_state);
            return (self.abandon_frame(acquired.is_some()), None);
        }
        self.ring.set_timestamp_pending(current_index, true);
        if traced {
            self.last_render_target = Some(current_target);
        }

        let (Some((image_index, image, _)), Some(swapchain)) = (acquired, swapchain) else {
            return (FrameOutcome::RenderedWithoutPresent, None);
        };
        match swapchain.present(device, image_index) {
            Some(result) => {
                if result.need_recreate() {
                    self.resize_requested = true;
                }
                match result {
                    GfxPresentResult::Presented { suboptimal } => {
                        if suboptimal {
                            log::debug!("{} presented a suboptimal image", frame_name);
                        }
                        (FrameOutcome::Presented, Some(image))
                    }
                    GfxPresentResult::OutOfDate => (FrameOutcome::RenderedWithoutPresent, Some(image)),
                }
            }
            None => (FrameOutcome::RenderedWithoutPresent, Some(image)),
        }
    }

    /// 放弃当前帧，让当前 slot 在下一轮可以继续使用
    fn abandon_frame(&mut self, image_acquired: bool) -> FrameOutcome {
        if image_acquired {
            // 已经 acquire 的 image 不会被呈现，重建 swapchain 让它回到可用状态
            self.resize_requested = true;
        }
        if let Err(err) = self.ring.recover_slot(self.device.as_ref(), image_acquired) {
            log::error!("{} failed to recover frame slot: {}", self.ring.frame_name(), err);
        }
        FrameOutcome::Abandoned
    }
}

// destroy
impl Renderer {
    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        if self.destroyed {
            return;
        }
        let device = self.device.as_ref();
        if let Err(err) = device.wait_idle() {
            log::error!("wait idle before renderer destroy failed: {}", err);
        }

        {
            let mut state = self.present.write();
            if let Some(mut swapchain) = state.swapchain.take() {
                swapchain.destroy(device);
            }
            state.last_present_image = None;
            state.surface = None;
        }
        self.ring.destroy(device);
        device.destroy_pipeline(self.render_pipeline);
        device.destroy_pipeline(self.display_pipeline);
        if let Some(tlas) = self.scene.replace_scene_tlas(None) {
            device.destroy_acceleration(tlas);
        }
        self.retired.destroy_all(device);
        self.scene.destroy_resources(device);
        self.descriptor_manager.destroy_all_descriptor_pools(device);
        self.last_render_target = None;

        self.destroyed = true;
        log::info!("renderer destroyed");
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("renderer dropped without destroy");
            self.destroy_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prism_gfx::{
        commands::command::GfxCommand,
        null_device::{GfxCall, NullDevice, NullFailure},
    };
    use prism_scene::memory_scene::MemoryScene;

    use super::*;
    use crate::{
        readback::{ChannelOrder, ValueType},
        test_utils::{EXTENT, create_renderer, try_create_renderer},
    };

    fn last_recorded(device: &NullDevice) -> Vec<GfxCommand> {
        device
            .calls()
            .into_iter()
            .rev()
            .find_map(|call| match call {
                GfxCall::RecordCommands { commands, .. } => Some(commands),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn present_count(device: &NullDevice) -> usize {
        device.calls().iter().filter(|call| matches!(call, GfxCall::Present { .. })).count()
    }

    #[test]
    fn first_frame_traces_and_accumulates() {
        let (device, _surface, mut renderer) = create_renderer();

        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert!(renderer.scene().is_ready_to_render());
        assert_eq!(renderer.frame_number(), 1);
        assert_eq!(renderer.render_parameters().num_emitters, 2);
        let commands = last_recorded(&device);
        assert!(commands.iter().any(|c| matches!(c, GfxCommand::ClearColorImage { .. })));
        assert!(commands.iter().any(|c| matches!(c, GfxCommand::TraceRays { .. })));

        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert_eq!(renderer.frame_number(), 2);
        assert_eq!(renderer.render_parameters().frame_number, 2);
        assert!(!last_recorded(&device).iter().any(|c| matches!(c, GfxCommand::ClearColorImage { .. })));

        // 任何变化都重新开始累积
        renderer.mark_dirty(DirtySet::CAMERA);
        renderer.tick();
        assert_eq!(renderer.frame_number(), 1);
        assert_eq!(renderer.statistics().frame_count, 1);

        renderer.destroy();
    }

    #[test]
    fn fence_is_waited_before_reuse() {
        let (device, _surface, mut renderer) = create_renderer();
        for _ in 0..8 {
            assert_eq!(renderer.tick(), FrameOutcome::Presented);
        }

        let mut in_flight = HashSet::new();
        let mut waited_submissions = 0;
        for call in device.calls() {
            match call {
                GfxCall::Submit { fence: Some(fence), .. } => {
                    in_flight.insert(fence);
                }
                GfxCall::WaitFence(fence) => {
                    if in_flight.remove(&fence) {
                        waited_submissions += 1;
                    }
                }
                GfxCall::ResetFence(fence) => assert!(!in_flight.contains(&fence)),
                _ => {}
            }
        }
        assert!(waited_submissions >= 5);

        renderer.destroy();
    }

    #[test]
    fn gpu_time_is_folded_one_frame_later() {
        let (_device, _surface, mut renderer) = create_renderer();

        renderer.tick();
        let snapshot = renderer.statistics();
        assert_eq!(snapshot.gpu_avg_ms, 0.0);
        assert_eq!(snapshot.frame_count, 1);

        renderer.tick();
        let snapshot = renderer.statistics_handle().snapshot();
        assert!((snapshot.gpu_avg_ms - 2.0).abs() < 1e-6);
        assert_eq!(snapshot.frame_count, 2);

        renderer.destroy();
    }

    #[test]
    fn empty_extent_pauses_presentation() {
        let (device, surface, mut renderer) = create_renderer();
        assert_eq!(renderer.tick(), FrameOutcome::Presented);

        device.set_surface_extent(surface, vk::Extent2D::default());
        let presents = present_count(&device);
        assert_eq!(renderer.tick(), FrameOutcome::RenderedWithoutPresent);
        assert_eq!(renderer.tick(), FrameOutcome::RenderedWithoutPresent);
        assert_eq!(present_count(&device), presents);
        assert_eq!(renderer.swapchain_extent(), None);
        assert_eq!(device.live_swapchains(), 0);
        assert!(renderer.grab_image(RenderImage::FinalLdr).is_empty());

        device.set_surface_extent(surface, EXTENT);
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert_eq!(renderer.swapchain_extent(), Some(EXTENT));

        renderer.destroy();
    }

    #[test]
    fn resize_recreates_targets_and_resets_progress() {
        let (device, surface, mut renderer) = create_renderer();
        renderer.tick();
        renderer.tick();
        assert_eq!(renderer.frame_number(), 2);

        let resized = vk::Extent2D { width: 32, height: 24 };
        device.set_surface_extent(surface, resized);
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert_eq!(renderer.swapchain_extent(), Some(resized));
        assert_eq!(renderer.frame_ring().target_extent(), resized);
        assert_eq!(renderer.frame_number(), 1);
        assert_eq!(renderer.statistics().frame_count, 1);

        let image = renderer.grab_image(RenderImage::Hdr);
        assert_eq!((image.width, image.height), (32, 24));

        renderer.destroy();
    }

    #[test]
    fn grab_image_reads_last_results() {
        let (_device, _surface, mut renderer) = create_renderer();
        assert!(renderer.grab_image(RenderImage::Hdr).is_empty());
        assert!(renderer.grab_image(RenderImage::FinalLdr).is_empty());

        renderer.tick();

        let hdr = renderer.grab_image(RenderImage::Hdr);
        assert_eq!((hdr.width, hdr.height, hdr.channels), (EXTENT.width, EXTENT.height, 4));
        assert_eq!(hdr.value_type, ValueType::Float32);
        assert_eq!(hdr.data.len(), (EXTENT.width * EXTENT.height * 16) as usize);
        assert!(hdr.data.iter().all(|b| *b == 0x7f));

        let ldr = renderer.grab_image(RenderImage::FinalLdr);
        assert_eq!(ldr.value_type, ValueType::UInt8);
        assert_eq!(ldr.channel_order, ChannelOrder::Bgra);
        assert_eq!(ldr.data.len(), (EXTENT.width * EXTENT.height * 4) as usize);
        assert!(ldr.data.iter().all(|b| *b == 0xff));

        renderer.destroy();
    }

    #[test]
    fn submit_failure_abandons_frame_and_recovers() {
        let (device, _surface, mut renderer) = create_renderer();

        device.inject_failure(NullFailure::Submit, 1);
        assert_eq!(renderer.tick(), FrameOutcome::Abandoned);
        assert!(renderer.grab_image(RenderImage::Hdr).is_empty());

        // 没有提交的初始化与清空在下一帧重新录制
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert!(last_recorded(&device).iter().any(|c| matches!(c, GfxCommand::ClearColorImage { .. })));
        for _ in 0..4 {
            assert_eq!(renderer.tick(), FrameOutcome::Presented);
        }
        assert_eq!(device.live_fences(), renderer.frame_ring().fif_count());

        renderer.destroy();
    }

    #[test]
    fn tlas_failure_skips_ray_tracing_until_rebuilt() {
        let (device, _surface, mut renderer) = create_renderer();

        device.inject_failure(NullFailure::BuildTlas, 1);
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert!(!renderer.scene().is_ready_to_render());
        assert!(renderer.dirty_tracker().peek().contains(DirtySet::ENTITY));
        let commands = last_recorded(&device);
        assert!(!commands.iter().any(|c| matches!(c, GfxCommand::TraceRays { .. })));
        assert!(commands.iter().any(|c| matches!(c, GfxCommand::DisplayPass { .. })));
        assert_eq!(renderer.frame_number(), 0);
        assert_eq!(renderer.statistics().frame_count, 0);

        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert!(renderer.scene().is_ready_to_render());
        assert!(last_recorded(&device).iter().any(|c| matches!(c, GfxCommand::TraceRays { .. })));
        assert_eq!(renderer.frame_number(), 1);
        assert_eq!(renderer.statistics().frame_count, 1);

        renderer.destroy();
    }

    #[test]
    fn failed_scene_update_is_retried_next_frame() {
        let (device, _surface, mut renderer) = create_renderer();

        // geometry 的 vertex buffer 创建失败，依赖它的 TLAS、instance、emitter 都被跳过
        device.inject_failure(NullFailure::CreateBuffer, 1);
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert!(!renderer.scene().is_ready_to_render());
        assert_eq!(renderer.frame_number(), 0);
        let pending = renderer.dirty_tracker().peek();
        assert!(pending.contains(DirtySet::GEOMETRY | DirtySet::ENTITY | DirtySet::LIGHT));

        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert!(renderer.scene().is_ready_to_render());
        assert!(last_recorded(&device).iter().any(|c| matches!(c, GfxCommand::TraceRays { .. })));
        assert_eq!(renderer.frame_number(), 1);
        assert_eq!(renderer.render_parameters().num_emitters, 2);
        assert_eq!(renderer.dirty_tracker().peek(), DirtySet::NONE);

        renderer.destroy();
    }

    #[test]
    fn suboptimal_acquire_keeps_the_swapchain() {
        let (device, _surface, mut renderer) = create_renderer();
        let swapchains_created =
            || device.calls().iter().filter(|call| matches!(call, GfxCall::CreateSwapchain { .. })).count();
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        let created = swapchains_created();

        device.inject_failure(NullFailure::SuboptimalAcquire, 1);
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert_eq!(swapchains_created(), created);
        assert_eq!(renderer.swapchain_extent(), Some(EXTENT));

        // out of date 仍然会重建
        device.inject_failure(NullFailure::Acquire, 1);
        assert_eq!(renderer.tick(), FrameOutcome::RenderedWithoutPresent);
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert_eq!(swapchains_created(), created + 1);

        renderer.destroy();
    }

    #[test]
    fn missing_surface_is_fatal() {
        let device = Arc::new(NullDevice::new());
        let result = try_create_renderer(&device, None, MemoryScene::new());
        assert!(matches!(result, Err(RendererError::NoSurface)));
        assert_eq!(device.live_pipelines(), 0);
    }

    #[test]
    fn surface_can_be_replaced_from_another_thread() {
        let (device, _surface, mut renderer) = create_renderer();
        assert_eq!(renderer.tick(), FrameOutcome::Presented);

        let host = renderer.surface_host();
        std::thread::spawn(move || host.set_surface(None)).join().unwrap();
        assert_eq!(renderer.tick(), FrameOutcome::NoSurface);
        assert_eq!(device.live_swapchains(), 0);
        assert!(renderer.grab_image(RenderImage::FinalLdr).is_empty());

        let surface = device.create_surface(EXTENT);
        renderer.surface_host().set_surface(Some(surface));
        assert_eq!(renderer.tick(), FrameOutcome::Presented);
        assert_eq!(device.live_swapchains(), 1);

        renderer.destroy();
    }

    #[test]
    fn destroy_releases_everything() {
        let (device, _surface, mut renderer) = create_renderer();
        for _ in 0..3 {
            renderer.tick();
        }
        renderer.mark_dirty(DirtySet::ENTITY);
        renderer.tick();
        renderer.destroy();

        assert_eq!(device.live_images(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_descriptor_sets(), 0);
        assert_eq!(device.live_accelerations(), 0);
        assert_eq!(device.live_swapchains(), 0);
        assert_eq!(device.live_pipelines(), 0);
        assert_eq!(device.live_query_pools(), 0);
    }
}

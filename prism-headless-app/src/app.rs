use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use ash::vk;
use prism_crate_tools::{init_log::init_log, workspace_path::PrismPath};
use prism_gfx::{
    descriptors::ClassDescriptorManager, device::GfxDevice, handles::GfxSurfaceHandle, null_device::NullDevice,
};
use prism_renderer::{
    config::RendererConfig,
    frame_ring::FrameRing,
    readback::RenderImage,
    renderer::{FrameOutcome, Renderer, RendererCreateInfo},
};
use prism_scene::{dirty::DirtySet, settings::StaticRenderSettings};
use serde::{Deserialize, Serialize};

use crate::cornell::{self, CAMERA};

/// 最小化持续的帧数
const MINIMIZED_FRAMES: u32 = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub frames: u32,
    pub window_extent: [u32; 2],
    /// 每隔多少帧打印一次统计，0 表示只在结束时打印
    pub report_interval: u32,
    pub settings: StaticRenderSettings,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            frames: 240,
            window_extent: [1280, 720],
            report_interval: 60,
            settings: StaticRenderSettings {
                camera: Some(CAMERA.0),
                ..Default::default()
            },
        }
    }
}

impl HeadlessConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path.as_ref()))?;
        anyhow::ensure!(config.frames > 0, "frames 必须大于 0");
        Ok(config)
    }

    #[inline]
    fn window_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.window_extent[0],
            height: self.window_extent[1],
        }
    }
}

/// 运行过程中模拟的窗口事件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowEvent {
    Resize(vk::Extent2D),
    Minimize,
    Restore,
    /// 在另一个线程中替换 surface
    ReplaceSurface,
    /// 相机被用户移动
    CameraMoved,
}

impl WindowEvent {
    /// 把总帧数分成四段，在每段的开头触发一个事件
    pub fn at_frame(frame: u32, total: u32, window_extent: vk::Extent2D) -> Option<Self> {
        let quarter = total / 4;
        if quarter == 0 || frame == 0 {
            return None;
        }
        match frame {
            f if f == quarter => Some(Self::Resize(vk::Extent2D {
                width: (window_extent.width / 2).max(1),
                height: (window_extent.height / 2).max(1),
            })),
            f if f == quarter * 2 => Some(Self::Minimize),
            f if f == quarter * 2 + MINIMIZED_FRAMES => Some(Self::Restore),
            f if f == quarter * 3 => Some(Self::ReplaceSurface),
            f if f == quarter * 3 + quarter / 2 => Some(Self::CameraMoved),
            _ => None,
        }
    }
}

pub struct HeadlessApp {
    config: HeadlessConfig,
    tick_interval: Duration,

    device: Arc<NullDevice>,
    surface_extent: vk::Extent2D,
    surface: GfxSurfaceHandle,
    renderer: Renderer,

    presented: u32,
    abandoned: u32,
}

// 总的 main 函数
impl HeadlessApp {
    pub fn init_env() {
        init_log();
    }

    /// 整个程序的入口
    pub fn run() -> anyhow::Result<()> {
        let renderer_config = load_or_default("renderer.toml", |path| RendererConfig::from_file(path))?;
        let config = load_or_default("headless.toml", |path| HeadlessConfig::from_file(path))?;

        let mut app = Self::new(config, renderer_config)?;
        app.run_frames();
        log::info!("end run.");
        app.destroy();
        Ok(())
    }
}

// new & init
impl HeadlessApp {
    pub fn new(config: HeadlessConfig, renderer_config: RendererConfig) -> anyhow::Result<Self> {
        let device = Arc::new(NullDevice::new());
        let surface_extent = config.window_extent();
        let surface = device.create_surface(surface_extent);

        let capabilities = device.surface_capabilities(surface).context("查询 surface 能力失败")?;
        let fif_count = FrameRing::fif_count_for(&capabilities);

        let aspect_ratio = surface_extent.width as f32 / surface_extent.height.max(1) as f32;
        let (scene, dirty) = cornell::cornell_box(aspect_ratio, fif_count as u32);
        let tick_interval = Duration::from_millis(renderer_config.tick_interval_ms);

        let renderer = Renderer::new(RendererCreateInfo {
            config: renderer_config,
            device: device.clone() as Arc<dyn GfxDevice>,
            surface: Some(surface),
            scene: Box::new(scene),
            descriptor_manager: Box::new(ClassDescriptorManager::new()),
            settings: Some(Arc::new(config.settings.clone())),
        })
        .context("创建 renderer 失败")?;
        renderer.mark_dirty(dirty);

        Ok(Self {
            config,
            tick_interval,
            device,
            surface_extent,
            surface,
            renderer,
            presented: 0,
            abandoned: 0,
        })
    }
}

// getters
impl HeadlessApp {
    #[inline]
    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    #[inline]
    pub fn presented(&self) -> u32 {
        self.presented
    }

    #[inline]
    pub fn abandoned(&self) -> u32 {
        self.abandoned
    }
}

// update
impl HeadlessApp {
    pub fn run_frames(&mut self) {
        let total = self.config.frames;
        for frame in 0..total {
            if let Some(event) = WindowEvent::at_frame(frame, total, self.config.window_extent()) {
                self.handle_event(event);
            }

            match self.renderer.tick() {
                FrameOutcome::Presented => self.presented += 1,
                FrameOutcome::Abandoned => self.abandoned += 1,
                _ => {}
            }

            let report_interval = self.config.report_interval;
            if report_interval > 0 && (frame + 1) % report_interval == 0 {
                self.report();
            }
            if !self.tick_interval.is_zero() {
                std::thread::sleep(self.tick_interval);
            }
        }

        self.report();
        self.grab_results();
    }

    fn handle_event(&mut self, event: WindowEvent) {
        log::info!("window event: {:?}", event);
        match event {
            WindowEvent::Resize(extent) => {
                self.surface_extent = extent;
                self.device.set_surface_extent(self.surface, extent);
            }
            WindowEvent::Minimize => self.device.set_surface_extent(self.surface, vk::Extent2D::default()),
            WindowEvent::Restore => self.device.set_surface_extent(self.surface, self.surface_extent),
            WindowEvent::ReplaceSurface => {
                let surface = self.device.create_surface(self.surface_extent);
                let host = self.renderer.surface_host();
                if std::thread::spawn(move || host.set_surface(Some(surface))).join().is_err() {
                    log::error!("surface replacement thread panicked");
                    return;
                }
                self.surface = surface;
            }
            WindowEvent::CameraMoved => self.renderer.mark_dirty(DirtySet::CAMERA),
        }
    }

    fn report(&self) {
        let stats = self.renderer.statistics();
        log::info!(
            "accumulated {} frames in {:.1}ms, cpu {:.3}ms, gpu {:.3}ms, presented {}, abandoned {}",
            stats.frame_count,
            stats.total_elapsed_ms,
            stats.cpu_avg_ms,
            stats.gpu_avg_ms,
            self.presented,
            self.abandoned
        );
    }

    fn grab_results(&self) {
        for kind in [RenderImage::Hdr, RenderImage::FinalLdr] {
            let image = self.renderer.grab_image(kind);
            if image.is_empty() {
                log::warn!("{:?} image is empty", kind);
                continue;
            }
            log::info!(
                "{:?} image: {}x{}, {} channels, {:?} {:?}, {} bytes",
                kind,
                image.width,
                image.height,
                image.channels,
                image.value_type,
                image.channel_order,
                image.data.len()
            );
        }
    }
}

// destroy
impl HeadlessApp {
    pub fn destroy(self) {
        self.renderer.destroy();
    }
}

/// 配置文件不存在时使用默认值
fn load_or_default<T: Default>(
    filename: &str,
    load: impl FnOnce(&Path) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let path = PrismPath::config_path(filename);
    if !path.exists() {
        log::info!("{:?} not found, using default config", path);
        return Ok(T::default());
    }
    load(&path)
}

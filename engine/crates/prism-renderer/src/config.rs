use std::{fs, path::Path};

use anyhow::Context;
use ash::vk;
use serde::{Deserialize, Serialize};

/// render target 的格式，累积渲染需要浮点格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderTargetFormat {
    Rgba32Float,
    Rgba16Float,
}

impl RenderTargetFormat {
    #[inline]
    pub fn vk_format(self) -> vk::Format {
        match self {
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub enable_vsync: bool,
    pub render_target_format: RenderTargetFormat,
    /// 每个资源类别的 descriptor 数量上限
    pub descriptor_pool_capacity: u32,
    pub max_recursion_depth: u32,
    /// CPU/GPU 帧时间滑动平均的窗口大小
    pub timing_window: usize,
    /// 外部驱动调用 tick 的间隔，0 表示尽可能快
    pub tick_interval_ms: u64,
    /// 等待 ring slot fence 的超时
    pub fence_timeout_ms: u64,
    /// grab_image 等待拷贝完成的超时
    pub readback_timeout_ms: u64,
    /// surface 不报告尺寸时（current_extent 为 0xFFFFFFFF）使用的窗口尺寸
    pub fallback_extent: [u32; 2],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            enable_vsync: false,
            render_target_format: RenderTargetFormat::Rgba32Float,
            descriptor_pool_capacity: 1024,
            max_recursion_depth: 16,
            timing_window: 60,
            tick_interval_ms: 0,
            fence_timeout_ms: 1000,
            readback_timeout_ms: 5000,
            fallback_extent: [1280, 720],
        }
    }
}

impl RendererConfig {
    /// 从 TOML 文件加载配置，缺失的字段使用默认值
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path.as_ref()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RendererConfig = toml::from_str(content)?;
        anyhow::ensure!(config.timing_window > 0, "timing_window 必须大于 0");
        Ok(config)
    }

    #[inline]
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }

    #[inline]
    pub fn readback_timeout_ns(&self) -> u64 {
        self.readback_timeout_ms.saturating_mul(1_000_000)
    }

    #[inline]
    pub fn fallback_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.fallback_extent[0],
            height: self.fallback_extent[1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = RendererConfig::from_toml_str(
            r#"
            enable_vsync = true
            render_target_format = "rgba16_float"
            "#,
        )
        .unwrap();
        assert!(config.enable_vsync);
        assert_eq!(config.render_target_format.vk_format(), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(config.descriptor_pool_capacity, 1024);
        assert_eq!(config.max_recursion_depth, 16);
    }

    #[test]
    fn zero_timing_window_is_rejected() {
        assert!(RendererConfig::from_toml_str("timing_window = 0").is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RendererConfig::from_file("/nonexistent/renderer.toml").unwrap_err();
        assert!(format!("{err:#}").contains("renderer.toml"));
    }
}

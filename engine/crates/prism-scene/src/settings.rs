use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// 渲染设置，每帧在 `begin_render_iteration` 读取一次
pub trait RenderSettings: Send + Sync {
    fn active_camera(&self) -> Option<EntityId>;

    fn primary_samples(&self) -> u32;
    fn secondary_samples(&self) -> u32;
    fn min_depth(&self) -> u32;
    fn max_depth(&self) -> u32;
    fn direct_radiance_clamp(&self) -> f32;
    fn indirect_radiance_clamp(&self) -> f32;
}

/// 固定不变的渲染设置，可以从配置文件读取
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticRenderSettings {
    pub camera: Option<u64>,
    pub primary_samples: u32,
    pub secondary_samples: u32,
    pub min_depth: u32,
    pub max_depth: u32,
    pub direct_radiance_clamp: f32,
    pub indirect_radiance_clamp: f32,
}

impl Default for StaticRenderSettings {
    fn default() -> Self {
        Self {
            camera: None,
            primary_samples: 1,
            secondary_samples: 1,
            min_depth: 2,
            max_depth: 8,
            direct_radiance_clamp: 100.0,
            indirect_radiance_clamp: 10.0,
        }
    }
}

impl RenderSettings for StaticRenderSettings {
    fn active_camera(&self) -> Option<EntityId> {
        self.camera.map(EntityId)
    }

    fn primary_samples(&self) -> u32 {
        self.primary_samples
    }

    fn secondary_samples(&self) -> u32 {
        self.secondary_samples
    }

    fn min_depth(&self) -> u32 {
        self.min_depth
    }

    fn max_depth(&self) -> u32 {
        self.max_depth
    }

    fn direct_radiance_clamp(&self) -> f32 {
        self.direct_radiance_clamp
    }

    fn indirect_radiance_clamp(&self) -> f32 {
        self.indirect_radiance_clamp
    }
}

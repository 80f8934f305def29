//! 场景 TLAS 的构建
//!
//! 每次都完整重建：读取场景当前的实例列表，构建新的 TLAS 交给场景，旧的 TLAS 延迟销毁。

use prism_gfx::{device::GfxDevice, error::GfxError};
use prism_scene::scene_manager::SceneManager;

use crate::retired::{RetiredResource, RetiredResources};

#[derive(Debug, Default)]
pub struct TlasBuilder {
    build_count: u64,
}

// getters
impl TlasBuilder {
    /// 成功构建的次数
    #[inline]
    pub fn build_count(&self) -> u64 {
        self.build_count
    }
}

// update
impl TlasBuilder {
    /// 用场景当前的实例重建 TLAS
    ///
    /// 没有实例时场景的 TLAS 被置空。构建失败时同样置空，帧调度会因此跳过光追。
    /// 旧的 TLAS 在 `frame_id` 退役。
    pub fn rebuild(
        &mut self,
        device: &dyn GfxDevice,
        scene: &mut dyn SceneManager,
        retired: &mut RetiredResources,
        frame_id: u64,
    ) -> Result<(), GfxError> {
        let _span = tracy_client::span!("TlasBuilder::rebuild");

        let instances = scene.tlas_instances();
        let result = if instances.is_empty() {
            log::debug!("no tlas instances, scene tlas cleared");
            Ok(None)
        } else {
            device.build_tlas(&instances, "scene-tlas").map(Some)
        };

        let new_tlas = match &result {
            Ok(tlas) => *tlas,
            Err(_) => None,
        };
        if let Some(old) = scene.replace_scene_tlas(new_tlas) {
            retired.retire(RetiredResource::Acceleration(old), frame_id);
        }

        let tlas = result?;
        if tlas.is_some() {
            self.build_count += 1;
            log::debug!("scene tlas rebuilt with {} instances", instances.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::Mat4;
    use prism_gfx::null_device::{NullDevice, NullFailure};
    use prism_scene::{
        ids::EntityId,
        memory_scene::{MaterialDesc, MemoryScene},
    };

    use super::*;

    fn scene_with_one_renderable(device: &NullDevice) -> MemoryScene {
        let mut scene = MemoryScene::new();
        scene.add_geometry(EntityId(1), 3, 3);
        scene.add_material(EntityId(2), MaterialDesc::default());
        scene.add_renderable(EntityId(3), EntityId(1), EntityId(2), Mat4::IDENTITY);
        let geometry = scene.lookup_geometry(EntityId(1)).unwrap();
        scene.build_geometry(device, geometry).unwrap();
        scene.gather_entities();
        scene
    }

    #[test]
    fn rebuild_retires_previous_tlas() {
        let device = NullDevice::new();
        let mut scene = scene_with_one_renderable(&device);
        let mut retired = RetiredResources::new(2);
        let mut builder = TlasBuilder::default();

        builder.rebuild(&device, &mut scene, &mut retired, 0).unwrap();
        let first = scene.scene_tlas().unwrap();
        builder.rebuild(&device, &mut scene, &mut retired, 1).unwrap();
        let second = scene.scene_tlas().unwrap();

        assert_ne!(first, second);
        assert_eq!(builder.build_count(), 2);
        assert_eq!(retired.pending_count(), 1);
        assert!(device.is_acceleration_alive(first));

        retired.reclaim(&device, 3);
        assert!(!device.is_acceleration_alive(first));
        assert!(device.is_acceleration_alive(second));
    }

    #[test]
    fn failed_build_clears_scene_tlas() {
        let device = NullDevice::new();
        let mut scene = scene_with_one_renderable(&device);
        let mut retired = RetiredResources::new(2);
        let mut builder = TlasBuilder::default();

        builder.rebuild(&device, &mut scene, &mut retired, 0).unwrap();
        device.inject_failure(NullFailure::BuildTlas, 1);
        let err = builder.rebuild(&device, &mut scene, &mut retired, 1).unwrap_err();

        assert!(err.is_out_of_memory());
        assert!(scene.scene_tlas().is_none());
        assert!(!scene.is_ready_to_render());
        assert_eq!(retired.pending_count(), 1);
    }
}

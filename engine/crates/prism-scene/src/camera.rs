use crate::{
    ids::EntityId,
    params::{CameraParameters, DisplayParameters, RenderParameters},
    scene_manager::SceneManager,
    settings::RenderSettings,
};

/// 当前活动的相机
///
/// 相机的 id 来自 [`RenderSettings`]，参数在 `refresh` 时从场景中读取一份快照，
/// 之后每帧写入 render/display 参数。
#[derive(Debug, Default)]
pub struct CameraManager {
    active_camera: Option<EntityId>,
    snapshot: Option<CameraParameters>,
}

// getters
impl CameraManager {
    #[inline]
    pub fn active_camera(&self) -> Option<EntityId> {
        self.active_camera
    }

    #[inline]
    pub fn snapshot(&self) -> Option<&CameraParameters> {
        self.snapshot.as_ref()
    }
}

// update
impl CameraManager {
    /// 重新解析设置中的相机 id
    ///
    /// id 无法解析为相机时保留之前的相机。返回活动相机是否发生了变化。
    pub fn update_active_camera(&mut self, settings: Option<&dyn RenderSettings>, scene: &dyn SceneManager) -> bool {
        let Some(camera) = settings.and_then(|settings| settings.active_camera()) else {
            return false;
        };
        let Some(params) = scene.camera_parameters(camera) else {
            log::debug!("entity {:?} is not a camera", camera);
            return false;
        };

        let changed = self.active_camera != Some(camera);
        self.active_camera = Some(camera);
        self.snapshot = Some(params);
        changed
    }

    /// 从场景中读取活动相机的最新参数
    pub fn refresh(&mut self, scene: &dyn SceneManager) {
        if let Some(camera) = self.active_camera {
            match scene.camera_parameters(camera) {
                Some(params) => self.snapshot = Some(params),
                None => {
                    log::debug!("active camera {:?} was removed", camera);
                    self.active_camera = None;
                    self.snapshot = None;
                }
            }
        }
    }
}

// tools
impl CameraManager {
    pub fn apply_render_parameters(&self, params: &mut RenderParameters) {
        let Some(camera) = &self.snapshot else {
            return;
        };
        params.camera_to_world = camera.camera_to_world;
        params.camera_lens = glam::Vec4::new(
            camera.aspect_ratio,
            (camera.fov_y * 0.5).tan(),
            camera.aperture,
            camera.focal_distance,
        );
    }

    pub fn apply_display_parameters(&self, params: &mut DisplayParameters) {
        let Some(camera) = &self.snapshot else {
            return;
        };
        params.exposure = camera.exposure;
        params.inv_gamma = if camera.gamma > 0.0 { 1.0 / camera.gamma } else { 1.0 };
    }
}

#[cfg(test)]
mod tests {
    use glam::Mat4;

    use super::*;
    use crate::{memory_scene::MemoryScene, settings::StaticRenderSettings};

    #[test]
    fn non_camera_id_keeps_previous_camera() {
        let mut scene = MemoryScene::new();
        let camera = CameraParameters {
            camera_to_world: Mat4::from_translation(glam::Vec3::new(0.0, 1.0, 5.0)),
            gamma: 2.0,
            ..Default::default()
        };
        scene.add_camera(EntityId(1), camera);

        let mut manager = CameraManager::default();
        let settings = StaticRenderSettings {
            camera: Some(1),
            ..Default::default()
        };
        assert!(manager.update_active_camera(Some(&settings), &scene));
        assert!(!manager.update_active_camera(Some(&settings), &scene));

        let not_a_camera = StaticRenderSettings {
            camera: Some(42),
            ..Default::default()
        };
        assert!(!manager.update_active_camera(Some(&not_a_camera), &scene));
        assert_eq!(manager.active_camera(), Some(EntityId(1)));

        let mut display = DisplayParameters::default();
        manager.apply_display_parameters(&mut display);
        assert_eq!(display.inv_gamma, 0.5);

        let mut render = RenderParameters::default();
        manager.apply_render_parameters(&mut render);
        assert_eq!(render.camera_to_world, camera.camera_to_world);
    }
}

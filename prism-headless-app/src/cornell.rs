use ash::vk;
use glam::{Mat4, Quat, Vec3};
use prism_scene::{
    dirty::DirtySet,
    ids::EntityId,
    memory_scene::{MaterialDesc, MemoryScene},
    params::CameraParameters,
};

pub const CAMERA: EntityId = EntityId(100);

const QUAD: EntityId = EntityId(10);
const CUBE: EntityId = EntityId(11);
const CHECKER: EntityId = EntityId(20);

const WHITE: EntityId = EntityId(30);
const RED: EntityId = EntityId(31);
const GREEN: EntityId = EntityId(32);
const LIGHT: EntityId = EntityId(33);

/// 构建 cornell box，返回场景以及需要报告给帧调度的脏标记
///
/// `retire_delay` 取在途帧的数量，被替换的场景资源在这么多帧之后才销毁
pub fn cornell_box(aspect_ratio: f32, retire_delay: u32) -> (MemoryScene, DirtySet) {
    let mut scene = MemoryScene::with_retire_delay(retire_delay);
    let mut dirty = DirtySet::NONE;

    dirty |= scene.add_geometry(QUAD, 4, 6);
    dirty |= scene.add_geometry(CUBE, 24, 36);
    dirty |= scene.add_texture(CHECKER, vk::Extent2D { width: 256, height: 256 });

    dirty |= scene.add_material(
        WHITE,
        MaterialDesc {
            albedo: Vec3::splat(0.73),
            texture: Some(CHECKER),
            ..Default::default()
        },
    );
    dirty |= scene.add_material(
        RED,
        MaterialDesc {
            albedo: Vec3::new(0.65, 0.05, 0.05),
            ..Default::default()
        },
    );
    dirty |= scene.add_material(
        GREEN,
        MaterialDesc {
            albedo: Vec3::new(0.12, 0.45, 0.15),
            ..Default::default()
        },
    );
    dirty |= scene.add_material(
        LIGHT,
        MaterialDesc {
            emission: Vec3::new(17.0, 12.0, 4.0),
            ..Default::default()
        },
    );

    let walls = [
        (WHITE, Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0))),
        (WHITE, Mat4::from_rotation_translation(Quat::from_rotation_x(180f32.to_radians()), Vec3::Y)),
        (WHITE, Mat4::from_rotation_translation(Quat::from_rotation_x(90f32.to_radians()), -Vec3::Z)),
        (RED, Mat4::from_rotation_translation(Quat::from_rotation_z(-90f32.to_radians()), -Vec3::X)),
        (GREEN, Mat4::from_rotation_translation(Quat::from_rotation_z(90f32.to_radians()), Vec3::X)),
    ];
    for (i, (material, transform)) in walls.into_iter().enumerate() {
        dirty |= scene.add_renderable(EntityId(1 + i as u64), QUAD, material, transform);
    }
    dirty |= scene.add_renderable(
        EntityId(6),
        CUBE,
        WHITE,
        Mat4::from_scale_rotation_translation(
            Vec3::splat(0.3),
            Quat::from_rotation_y(15f32.to_radians()),
            Vec3::new(0.35, -0.7, 0.3),
        ),
    );
    dirty |= scene.add_renderable(
        EntityId(7),
        QUAD,
        LIGHT,
        Mat4::from_scale_rotation_translation(
            Vec3::splat(0.25),
            Quat::from_rotation_x(180f32.to_radians()),
            Vec3::new(0.0, 0.99, 0.0),
        ),
    );
    dirty |= scene.add_light(EntityId(8), Vec3::new(1.0, 0.9, 0.8), Mat4::from_translation(Vec3::new(0.0, 0.9, 0.0)));

    dirty |= scene.add_camera(
        CAMERA,
        CameraParameters {
            camera_to_world: Mat4::look_at_rh(Vec3::new(0.0, 0.0, 3.4), Vec3::ZERO, Vec3::Y).inverse(),
            aspect_ratio,
            fov_y: 40f32.to_radians(),
            ..Default::default()
        },
    );

    (scene, dirty)
}

#[cfg(test)]
mod tests {
    use prism_scene::scene_manager::SceneManager;

    use super::*;

    #[test]
    fn cornell_box_follows_frames_in_flight() {
        let (mut scene, dirty) = cornell_box(16.0 / 9.0, 5);
        assert_eq!(scene.retire_delay(), 5);
        assert!(dirty.contains(DirtySet::GEOMETRY | DirtySet::TEXTURE | DirtySet::CAMERA));

        scene.gather_entities();
        assert_eq!(scene.renderable_count(), 7);
        assert!(scene.camera_parameters(CAMERA).is_some());
    }
}

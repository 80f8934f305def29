use std::sync::Arc;

use ash::vk;
use glam::{Mat4, Vec3};
use prism_gfx::{descriptors::ClassDescriptorManager, device::GfxDevice, handles::GfxSurfaceHandle, null_device::NullDevice};
use prism_scene::{
    dirty::DirtySet,
    ids::EntityId,
    memory_scene::{MaterialDesc, MemoryScene},
    params::CameraParameters,
    settings::StaticRenderSettings,
};

use crate::{
    config::RendererConfig,
    error::RendererResult,
    renderer::{Renderer, RendererCreateInfo},
};

pub(crate) const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 64,
    height: 48,
};

pub(crate) const CAMERA: EntityId = EntityId(100);

/// 一个三角形、一张贴图、一个发光材质、一盏灯、一个相机
pub(crate) fn demo_scene() -> (MemoryScene, DirtySet) {
    let mut scene = MemoryScene::new();
    let mut dirty = DirtySet::NONE;
    dirty |= scene.add_geometry(EntityId(10), 3, 3);
    dirty |= scene.add_texture(EntityId(20), vk::Extent2D { width: 4, height: 4 });
    dirty |= scene.add_material(EntityId(30), MaterialDesc::default());
    dirty |= scene.add_material(
        EntityId(31),
        MaterialDesc {
            emission: Vec3::ONE,
            ..Default::default()
        },
    );
    dirty |= scene.add_renderable(EntityId(1), EntityId(10), EntityId(30), Mat4::IDENTITY);
    dirty |= scene.add_renderable(EntityId(2), EntityId(10), EntityId(31), Mat4::from_translation(Vec3::X));
    dirty |= scene.add_light(EntityId(3), Vec3::ONE, Mat4::IDENTITY);
    dirty |= scene.add_camera(CAMERA, CameraParameters::default());
    (scene, dirty)
}

pub(crate) fn try_create_renderer(
    device: &Arc<NullDevice>,
    surface: Option<GfxSurfaceHandle>,
    scene: MemoryScene,
) -> RendererResult<Renderer> {
    Renderer::new(RendererCreateInfo {
        config: RendererConfig::default(),
        device: device.clone() as Arc<dyn GfxDevice>,
        surface,
        scene: Box::new(scene),
        descriptor_manager: Box::new(ClassDescriptorManager::new()),
        settings: Some(Arc::new(StaticRenderSettings {
            camera: Some(CAMERA.0),
            ..Default::default()
        })),
    })
}

/// 创建 renderer 并报告 demo 场景的全部变化
pub(crate) fn create_renderer() -> (Arc<NullDevice>, GfxSurfaceHandle, Renderer) {
    let device = Arc::new(NullDevice::new());
    let surface = device.create_surface(EXTENT);
    let (scene, dirty) = demo_scene();
    let renderer = try_create_renderer(&device, Some(surface), scene).unwrap();
    renderer.mark_dirty(dirty);
    (device, surface, renderer)
}

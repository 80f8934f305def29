use prism_gfx::{
    device::{GfxDevice, GfxTlasInstance},
    handles::{GfxAccelerationHandle, GfxBufferHandle},
};

use crate::{
    error::SceneResult,
    ids::{EntityId, GeometryHandle, MaterialHandle, TextureHandle},
    params::CameraParameters,
};

/// 帧调度所需的场景接口
///
/// 场景持有 TLAS、instance/material/emitter buffer 等 GPU 资源，帧调度只通过句柄只读地使用它们。
/// 所有 `&mut self` 的方法都由帧调度线程在 job 中调用。
pub trait SceneManager: Send {
    // ------------------------------ 渲染就绪状态 ------------------------------
    /// 至少有一个可渲染实体，并且 TLAS 有效
    fn is_ready_to_render(&self) -> bool {
        self.renderable_count() > 0 && self.scene_tlas().is_some()
    }
    fn renderable_count(&self) -> usize;
    fn scene_tlas(&self) -> Option<GfxAccelerationHandle>;
    fn instance_buffer(&self) -> Option<GfxBufferHandle>;
    fn material_buffer(&self) -> Option<GfxBufferHandle>;
    fn emitter_buffer(&self) -> Option<GfxBufferHandle>;
    fn num_emitters(&self) -> u32;

    // ------------------------------ 每帧维护 ------------------------------
    /// 重新收集可渲染实体
    fn gather_entities(&mut self);
    /// 在当前帧的 fence 等待之后调用，销毁不再被任何在途帧使用的资源
    fn update_retired_resources(&mut self, device: &dyn GfxDevice);

    // ------------------------------ 脏组件 ------------------------------
    /// 取走自上次调用以来发生变化的 geometry，同时清空脏列表
    fn acquire_dirty_geometries(&mut self) -> Vec<EntityId>;
    fn lookup_geometry(&self, id: EntityId) -> Option<GeometryHandle>;
    fn acquire_dirty_textures(&mut self) -> Vec<EntityId>;
    fn lookup_texture(&self, id: EntityId) -> Option<TextureHandle>;
    fn acquire_dirty_materials(&mut self) -> Vec<EntityId>;
    fn lookup_material(&self, id: EntityId) -> Option<MaterialHandle>;
    /// job 失败后把组件放回脏列表，下一次 acquire 时重新处理；已经删除的组件被忽略
    fn requeue_dirty_geometry(&mut self, geometry: GeometryHandle);
    fn requeue_dirty_texture(&mut self, texture: TextureHandle);
    fn requeue_dirty_material(&mut self, material: MaterialHandle);
    /// 当前所有有效的 material
    fn active_materials(&self) -> Vec<MaterialHandle>;

    /// id 对应的节点是相机时返回相机参数
    fn camera_parameters(&self, id: EntityId) -> Option<CameraParameters>;

    // ------------------------------ job 的动作 ------------------------------
    fn update_world_transforms(&mut self) -> SceneResult<()>;
    fn build_geometry(&mut self, device: &dyn GfxDevice, geometry: GeometryHandle) -> SceneResult<()>;
    fn upload_texture(&mut self, device: &dyn GfxDevice, texture: TextureHandle) -> SceneResult<()>;
    fn update_materials(&mut self, device: &dyn GfxDevice, materials: &[MaterialHandle]) -> SceneResult<()>;
    fn update_instance_buffer(&mut self, device: &dyn GfxDevice) -> SceneResult<()>;
    fn update_emitters(&mut self, device: &dyn GfxDevice) -> SceneResult<()>;

    /// 当前所有可渲染实体对应的 TLAS 实例
    fn tlas_instances(&self) -> Vec<GfxTlasInstance>;
    /// 替换场景的 TLAS，返回旧的 TLAS，由调用方负责延迟销毁
    fn replace_scene_tlas(&mut self, tlas: Option<GfxAccelerationHandle>) -> Option<GfxAccelerationHandle>;

    // ------------------------------ destroy ------------------------------
    fn destroy_resources(&mut self, device: &dyn GfxDevice);
}

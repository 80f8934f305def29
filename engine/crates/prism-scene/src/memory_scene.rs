//! 在内存中保存全部场景数据的 [`SceneManager`] 实现
//!
//! 节点以 [`EntityId`] 标识，geometry、texture、material 另外放在各自的 slotmap 中，
//! 通过 id -> handle 的映射解析。GPU 资源在被替换时不会立即销毁，而是放入退役列表，
//! 在若干次 [`SceneManager::update_retired_resources`] 之后才真正释放。

use std::collections::{BTreeMap, HashMap};

use ash::vk;
use glam::{Mat4, Vec3};
use prism_gfx::{
    device::{GfxBlasGeometry, GfxBufferCreateInfo, GfxDevice, GfxImageCreateInfo, GfxTlasInstance},
    handles::{GfxAccelerationHandle, GfxBufferHandle, GfxImageHandle},
};
use slotmap::SlotMap;

use crate::{
    dirty::DirtySet,
    error::{SceneError, SceneResult},
    ids::{EntityId, GeometryHandle, MaterialHandle, TextureHandle},
    params::CameraParameters,
    scene_manager::SceneManager,
};

/// transform(3x4) + geometry index + material index + padding
const INSTANCE_STRIDE: vk::DeviceSize = 64;
const MATERIAL_STRIDE: vk::DeviceSize = 48;
const EMITTER_STRIDE: vk::DeviceSize = 32;
const VERTEX_STRIDE: vk::DeviceSize = 12;
const INDEX_STRIDE: vk::DeviceSize = 4;

/// 只在在途帧不超过 4 时是安全的，更多时使用 [`MemoryScene::with_retire_delay`]
const DEFAULT_RETIRE_DELAY: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialDesc {
    pub albedo: Vec3,
    pub emission: Vec3,
    pub texture: Option<EntityId>,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            albedo: Vec3::splat(0.8),
            emission: Vec3::ZERO,
            texture: None,
        }
    }
}

/// 收集之后的可渲染实体
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Renderable {
    pub entity: EntityId,
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
    pub world_transform: Mat4,
}

struct GeometryRecord {
    id: EntityId,
    vertex_count: u32,
    index_count: u32,
    vertex_buffer: Option<GfxBufferHandle>,
    index_buffer: Option<GfxBufferHandle>,
    blas: Option<GfxAccelerationHandle>,
}

struct TextureRecord {
    id: EntityId,
    extent: vk::Extent2D,
    image: Option<GfxImageHandle>,
}

struct MaterialRecord {
    id: EntityId,
    desc: MaterialDesc,
}

enum NodeKind {
    Renderable { geometry: EntityId, material: EntityId },
    Light { color: Vec3 },
    Camera(CameraParameters),
}

struct NodeRecord {
    kind: NodeKind,
    local_transform: Mat4,
    world_transform: Mat4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RetiredObject {
    Buffer(GfxBufferHandle),
    Image(GfxImageHandle),
    Acceleration(GfxAccelerationHandle),
}

impl RetiredObject {
    fn destroy(self, device: &dyn GfxDevice) {
        match self {
            Self::Buffer(buffer) => device.destroy_buffer(buffer),
            Self::Image(image) => device.destroy_image(image),
            Self::Acceleration(acceleration) => device.destroy_acceleration(acceleration),
        }
    }
}

pub struct MemoryScene {
    nodes: BTreeMap<EntityId, NodeRecord>,

    geometries: SlotMap<GeometryHandle, GeometryRecord>,
    geometry_ids: HashMap<EntityId, GeometryHandle>,
    textures: SlotMap<TextureHandle, TextureRecord>,
    texture_ids: HashMap<EntityId, TextureHandle>,
    materials: SlotMap<MaterialHandle, MaterialRecord>,
    material_ids: HashMap<EntityId, MaterialHandle>,

    dirty_geometries: Vec<EntityId>,
    dirty_textures: Vec<EntityId>,
    dirty_materials: Vec<EntityId>,

    renderables: Vec<Renderable>,
    num_emitters: u32,

    tlas: Option<GfxAccelerationHandle>,
    instance_buffer: Option<GfxBufferHandle>,
    material_buffer: Option<GfxBufferHandle>,
    emitter_buffer: Option<GfxBufferHandle>,

    /// (资源, 还需要经过的帧数)
    retired: Vec<(RetiredObject, u32)>,
    retire_delay: u32,
}

impl Default for MemoryScene {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl MemoryScene {
    pub fn new() -> Self {
        Self::with_retire_delay(DEFAULT_RETIRE_DELAY)
    }

    /// `retire_delay` 应当不小于在途帧的数量
    pub fn with_retire_delay(retire_delay: u32) -> Self {
        Self {
            nodes: BTreeMap::new(),
            geometries: SlotMap::with_key(),
            geometry_ids: HashMap::new(),
            textures: SlotMap::with_key(),
            texture_ids: HashMap::new(),
            materials: SlotMap::with_key(),
            material_ids: HashMap::new(),
            dirty_geometries: Vec::new(),
            dirty_textures: Vec::new(),
            dirty_materials: Vec::new(),
            renderables: Vec::new(),
            num_emitters: 0,
            tlas: None,
            instance_buffer: None,
            material_buffer: None,
            emitter_buffer: None,
            retired: Vec::new(),
            retire_delay,
        }
    }
}

// getters
impl MemoryScene {
    #[inline]
    pub fn renderables(&self) -> &[Renderable] {
        &self.renderables
    }

    #[inline]
    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    #[inline]
    pub fn retire_delay(&self) -> u32 {
        self.retire_delay
    }

    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn geometry_blas(&self, id: EntityId) -> Option<GfxAccelerationHandle> {
        self.geometry_ids.get(&id).and_then(|h| self.geometries.get(*h)).and_then(|g| g.blas)
    }

    pub fn texture_image(&self, id: EntityId) -> Option<GfxImageHandle> {
        self.texture_ids.get(&id).and_then(|h| self.textures.get(*h)).and_then(|t| t.image)
    }
}

// 修改场景，返回需要报告给帧调度的脏标记
impl MemoryScene {
    pub fn add_geometry(&mut self, id: EntityId, vertex_count: u32, index_count: u32) -> DirtySet {
        match self.geometry_ids.get(&id).and_then(|h| self.geometries.get_mut(*h)) {
            Some(record) => {
                record.vertex_count = vertex_count;
                record.index_count = index_count;
            }
            None => {
                let handle = self.geometries.insert(GeometryRecord {
                    id,
                    vertex_count,
                    index_count,
                    vertex_buffer: None,
                    index_buffer: None,
                    blas: None,
                });
                self.geometry_ids.insert(id, handle);
            }
        }
        push_unique(&mut self.dirty_geometries, id);
        DirtySet::GEOMETRY
    }

    /// 已经进入脏列表的 id 会在 lookup 时被丢弃
    pub fn remove_geometry(&mut self, id: EntityId) -> DirtySet {
        let Some(record) = self.geometry_ids.remove(&id).and_then(|h| self.geometries.remove(h)) else {
            return DirtySet::NONE;
        };
        self.retire_buffer(record.vertex_buffer);
        self.retire_buffer(record.index_buffer);
        if let Some(blas) = record.blas {
            self.retire(RetiredObject::Acceleration(blas));
        }
        DirtySet::GEOMETRY | DirtySet::ENTITY
    }

    pub fn add_texture(&mut self, id: EntityId, extent: vk::Extent2D) -> DirtySet {
        match self.texture_ids.get(&id).and_then(|h| self.textures.get_mut(*h)) {
            Some(record) => record.extent = extent,
            None => {
                let handle = self.textures.insert(TextureRecord {
                    id,
                    extent,
                    image: None,
                });
                self.texture_ids.insert(id, handle);
            }
        }
        push_unique(&mut self.dirty_textures, id);
        DirtySet::TEXTURE
    }

    pub fn add_material(&mut self, id: EntityId, desc: MaterialDesc) -> DirtySet {
        match self.material_ids.get(&id).and_then(|h| self.materials.get_mut(*h)) {
            Some(record) => record.desc = desc,
            None => {
                let handle = self.materials.insert(MaterialRecord { id, desc });
                self.material_ids.insert(id, handle);
            }
        }
        push_unique(&mut self.dirty_materials, id);
        DirtySet::MATERIAL
    }

    pub fn add_renderable(&mut self, id: EntityId, geometry: EntityId, material: EntityId, transform: Mat4) -> DirtySet {
        self.insert_node(id, NodeKind::Renderable { geometry, material }, transform);
        DirtySet::ENTITY | DirtySet::TRANSFORM
    }

    pub fn add_light(&mut self, id: EntityId, color: Vec3, transform: Mat4) -> DirtySet {
        self.insert_node(id, NodeKind::Light { color }, transform);
        DirtySet::LIGHT
    }

    pub fn add_camera(&mut self, id: EntityId, camera: CameraParameters) -> DirtySet {
        self.insert_node(id, NodeKind::Camera(camera), camera.camera_to_world);
        DirtySet::CAMERA
    }

    pub fn set_transform(&mut self, id: EntityId, transform: Mat4) -> DirtySet {
        let Some(node) = self.nodes.get_mut(&id) else {
            return DirtySet::NONE;
        };
        node.local_transform = transform;
        match &mut node.kind {
            NodeKind::Camera(camera) => {
                camera.camera_to_world = transform;
                DirtySet::CAMERA
            }
            _ => DirtySet::TRANSFORM,
        }
    }

    pub fn remove_node(&mut self, id: EntityId) -> DirtySet {
        match self.nodes.remove(&id).map(|node| node.kind) {
            Some(NodeKind::Renderable { .. }) => DirtySet::ENTITY,
            Some(NodeKind::Light { .. }) => DirtySet::LIGHT,
            Some(NodeKind::Camera(_)) => DirtySet::CAMERA,
            None => DirtySet::NONE,
        }
    }
}

// tools
impl MemoryScene {
    fn insert_node(&mut self, id: EntityId, kind: NodeKind, transform: Mat4) {
        self.nodes.insert(
            id,
            NodeRecord {
                kind,
                local_transform: transform,
                world_transform: transform,
            },
        );
    }

    fn retire(&mut self, object: RetiredObject) {
        self.retired.push((object, self.retire_delay));
    }

    fn retire_buffer(&mut self, buffer: Option<GfxBufferHandle>) {
        if let Some(buffer) = buffer {
            self.retire(RetiredObject::Buffer(buffer));
        }
    }

    fn is_emissive(&self, material: MaterialHandle) -> bool {
        self.materials.get(material).is_some_and(|m| m.desc.emission != Vec3::ZERO)
    }
}

impl SceneManager for MemoryScene {
    fn is_ready_to_render(&self) -> bool {
        !self.renderables.is_empty()
            && self.tlas.is_some()
            && self.instance_buffer.is_some()
            && self.material_buffer.is_some()
    }

    fn renderable_count(&self) -> usize {
        self.renderables.len()
    }

    fn scene_tlas(&self) -> Option<GfxAccelerationHandle> {
        self.tlas
    }

    fn instance_buffer(&self) -> Option<GfxBufferHandle> {
        self.instance_buffer
    }

    fn material_buffer(&self) -> Option<GfxBufferHandle> {
        self.material_buffer
    }

    fn emitter_buffer(&self) -> Option<GfxBufferHandle> {
        self.emitter_buffer
    }

    fn num_emitters(&self) -> u32 {
        self.num_emitters
    }

    fn gather_entities(&mut self) {
        self.renderables = self
            .nodes
            .iter()
            .filter_map(|(id, node)| {
                let NodeKind::Renderable { geometry, material } = node.kind else {
                    return None;
                };
                match (self.geometry_ids.get(&geometry), self.material_ids.get(&material)) {
                    (Some(geometry), Some(material)) => Some(Renderable {
                        entity: *id,
                        geometry: *geometry,
                        material: *material,
                        world_transform: node.world_transform,
                    }),
                    _ => {
                        log::debug!("entity {:?} has unresolved geometry or material, skipped", id);
                        None
                    }
                }
            })
            .collect();
        log::debug!("gathered {} renderables", self.renderables.len());
    }

    fn update_retired_resources(&mut self, device: &dyn GfxDevice) {
        self.retired.retain_mut(|(object, frames_left)| {
            if *frames_left > 0 {
                *frames_left -= 1;
                return true;
            }
            object.destroy(device);
            false
        });
    }

    fn acquire_dirty_geometries(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.dirty_geometries)
    }

    fn lookup_geometry(&self, id: EntityId) -> Option<GeometryHandle> {
        self.geometry_ids.get(&id).copied()
    }

    fn acquire_dirty_textures(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.dirty_textures)
    }

    fn lookup_texture(&self, id: EntityId) -> Option<TextureHandle> {
        self.texture_ids.get(&id).copied()
    }

    fn acquire_dirty_materials(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.dirty_materials)
    }

    fn lookup_material(&self, id: EntityId) -> Option<MaterialHandle> {
        self.material_ids.get(&id).copied()
    }

    fn requeue_dirty_geometry(&mut self, geometry: GeometryHandle) {
        if let Some(id) = self.geometries.get(geometry).map(|g| g.id) {
            push_unique(&mut self.dirty_geometries, id);
        }
    }

    fn requeue_dirty_texture(&mut self, texture: TextureHandle) {
        if let Some(id) = self.textures.get(texture).map(|t| t.id) {
            push_unique(&mut self.dirty_textures, id);
        }
    }

    fn requeue_dirty_material(&mut self, material: MaterialHandle) {
        if let Some(id) = self.materials.get(material).map(|m| m.id) {
            push_unique(&mut self.dirty_materials, id);
        }
    }

    fn active_materials(&self) -> Vec<MaterialHandle> {
        self.materials.keys().collect()
    }

    fn camera_parameters(&self, id: EntityId) -> Option<CameraParameters> {
        match self.nodes.get(&id).map(|node| &node.kind) {
            Some(NodeKind::Camera(camera)) => Some(*camera),
            _ => None,
        }
    }

    fn update_world_transforms(&mut self) -> SceneResult<()> {
        // 场景是扁平的，world transform 就是 local transform
        for node in self.nodes.values_mut() {
            node.world_transform = node.local_transform;
        }
        for renderable in &mut self.renderables {
            if let Some(node) = self.nodes.get(&renderable.entity) {
                renderable.world_transform = node.world_transform;
            }
        }
        Ok(())
    }

    fn build_geometry(&mut self, device: &dyn GfxDevice, geometry: GeometryHandle) -> SceneResult<()> {
        let (id, vertex_count, index_count) = {
            let record = self.geometries.get(geometry).ok_or(SceneError::StaleHandle("geometry"))?;
            (record.id, record.vertex_count, record.index_count)
        };

        let vertex_buffer = create_storage_buffer(
            device,
            vertex_count as vk::DeviceSize * VERTEX_STRIDE,
            &format!("geometry-{}-vertices", id.0),
        )?;
        let index_buffer = match create_storage_buffer(
            device,
            index_count as vk::DeviceSize * INDEX_STRIDE,
            &format!("geometry-{}-indices", id.0),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_buffer(vertex_buffer);
                return Err(err);
            }
        };
        let blas = device.build_blas(
            &GfxBlasGeometry {
                vertex_buffer,
                vertex_count,
                index_buffer,
                index_count,
            },
            &format!("geometry-{}-blas", id.0),
        );
        let blas = match blas {
            Ok(blas) => blas,
            Err(err) => {
                device.destroy_buffer(vertex_buffer);
                device.destroy_buffer(index_buffer);
                return Err(err.into());
            }
        };

        let record = self.geometries.get_mut(geometry).ok_or(SceneError::StaleHandle("geometry"))?;
        let old_vertex = record.vertex_buffer.replace(vertex_buffer);
        let old_index = record.index_buffer.replace(index_buffer);
        let old_blas = record.blas.replace(blas);

        self.retire_buffer(old_vertex);
        self.retire_buffer(old_index);
        if let Some(old_blas) = old_blas {
            self.retire(RetiredObject::Acceleration(old_blas));
        }
        Ok(())
    }

    fn upload_texture(&mut self, device: &dyn GfxDevice, texture: TextureHandle) -> SceneResult<()> {
        let record = self.textures.get_mut(texture).ok_or(SceneError::StaleHandle("texture"))?;
        let image = device.create_image(&GfxImageCreateInfo {
            extent: record.extent,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            debug_name: format!("texture-{}", record.id.0),
        })?;
        if let Some(old) = record.image.replace(image) {
            self.retire(RetiredObject::Image(old));
        }
        Ok(())
    }

    fn update_materials(&mut self, device: &dyn GfxDevice, materials: &[MaterialHandle]) -> SceneResult<()> {
        let updated = materials.iter().filter(|m| self.materials.contains_key(**m)).count();
        if updated < materials.len() {
            log::debug!("{} stale materials skipped", materials.len() - updated);
        }

        // material buffer 总是包含全部 material，按 slotmap 的顺序排列
        let size = self.materials.len() as vk::DeviceSize * MATERIAL_STRIDE;
        let buffer = create_storage_buffer(device, size, "scene-materials")?;
        let old = self.material_buffer.replace(buffer);
        self.retire_buffer(old);
        log::debug!("material buffer rebuilt, {} of {} materials changed", updated, self.materials.len());
        Ok(())
    }

    fn update_instance_buffer(&mut self, device: &dyn GfxDevice) -> SceneResult<()> {
        let size = self.renderables.len() as vk::DeviceSize * INSTANCE_STRIDE;
        let buffer = create_storage_buffer(device, size, "scene-instances")?;
        let old = self.instance_buffer.replace(buffer);
        self.retire_buffer(old);
        Ok(())
    }

    fn update_emitters(&mut self, device: &dyn GfxDevice) -> SceneResult<()> {
        let emissive = self.renderables.iter().filter(|r| self.is_emissive(r.material)).count();
        let lights = self
            .nodes
            .values()
            .filter(|node| matches!(node.kind, NodeKind::Light { color } if color != Vec3::ZERO))
            .count();
        let count = (emissive + lights) as u32;

        let buffer = if count > 0 {
            Some(create_storage_buffer(device, count as vk::DeviceSize * EMITTER_STRIDE, "scene-emitters")?)
        } else {
            None
        };
        let old = std::mem::replace(&mut self.emitter_buffer, buffer);
        self.retire_buffer(old);
        self.num_emitters = count;
        Ok(())
    }

    fn tlas_instances(&self) -> Vec<GfxTlasInstance> {
        self.renderables
            .iter()
            .enumerate()
            .filter_map(|(index, renderable)| {
                let blas = self.geometries.get(renderable.geometry).and_then(|g| g.blas);
                if blas.is_none() {
                    log::debug!("entity {:?} has no blas yet", renderable.entity);
                }
                blas.map(|blas| GfxTlasInstance {
                    blas,
                    transform: renderable.world_transform,
                    custom_index: index as u32,
                    mask: 0xff,
                    sbt_record_offset: 0,
                })
            })
            .collect()
    }

    fn replace_scene_tlas(&mut self, tlas: Option<GfxAccelerationHandle>) -> Option<GfxAccelerationHandle> {
        std::mem::replace(&mut self.tlas, tlas)
    }

    fn destroy_resources(&mut self, device: &dyn GfxDevice) {
        for (object, _) in self.retired.drain(..) {
            object.destroy(device);
        }
        for geometry in self.geometries.values_mut() {
            for buffer in [geometry.vertex_buffer.take(), geometry.index_buffer.take()].into_iter().flatten() {
                device.destroy_buffer(buffer);
            }
            if let Some(blas) = geometry.blas.take() {
                device.destroy_acceleration(blas);
            }
        }
        for texture in self.textures.values_mut() {
            if let Some(image) = texture.image.take() {
                device.destroy_image(image);
            }
        }
        for buffer in [self.instance_buffer.take(), self.material_buffer.take(), self.emitter_buffer.take()]
            .into_iter()
            .flatten()
        {
            device.destroy_buffer(buffer);
        }
        if let Some(tlas) = self.tlas.take() {
            device.destroy_acceleration(tlas);
        }
        self.num_emitters = 0;
    }
}

fn create_storage_buffer(device: &dyn GfxDevice, size: vk::DeviceSize, debug_name: &str) -> SceneResult<GfxBufferHandle> {
    let buffer = device.create_buffer(&GfxBufferCreateInfo {
        size: size.max(1),
        usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        host_visible: false,
        debug_name: debug_name.to_string(),
    })?;
    Ok(buffer)
}

fn push_unique(list: &mut Vec<EntityId>, id: EntityId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

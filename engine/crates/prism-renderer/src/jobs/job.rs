use prism_gfx::{device::GfxDevice, error::GfxError};
use prism_scene::{
    camera::CameraManager,
    dirty::DirtySet,
    error::SceneError,
    ids::{GeometryHandle, MaterialHandle, TextureHandle},
    scene_manager::SceneManager,
};
use thiserror::Error;

use crate::{retired::RetiredResources, tlas::TlasBuilder};

/// material 更新的范围
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MaterialTarget {
    /// texture 发生变化后需要重建全部 material
    All(Vec<MaterialHandle>),
    Dirty(Vec<MaterialHandle>),
}

impl MaterialTarget {
    #[inline]
    pub fn materials(&self) -> &[MaterialHandle] {
        match self {
            Self::All(materials) | Self::Dirty(materials) => materials,
        }
    }

    #[inline]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobKind {
    UpdateTransforms,
    BuildGeometry(GeometryHandle),
    UploadTexture(TextureHandle),
    UpdateMaterials(MaterialTarget),
    /// 重新读取活动相机的参数
    UpdateRenderParameters,
    UpdateInstanceBuffer,
    UpdateEmitters,
    BuildTlas,
    ReclaimExpiredResources,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateTransforms => "update-transforms",
            Self::BuildGeometry(_) => "build-geometry",
            Self::UploadTexture(_) => "upload-texture",
            Self::UpdateMaterials(_) => "update-materials",
            Self::UpdateRenderParameters => "update-render-parameters",
            Self::UpdateInstanceBuffer => "update-instance-buffer",
            Self::UpdateEmitters => "update-emitters",
            Self::BuildTlas => "build-tlas",
            Self::ReclaimExpiredResources => "reclaim-expired-resources",
        }
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error("tlas build failed: {0}")]
    Tlas(#[source] GfxError),
}

impl JobError {
    /// 失效的句柄不算错误，直接跳过
    #[inline]
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::Scene(SceneError::StaleHandle(_)))
    }
}

/// job 执行时可以访问的状态
pub struct JobContext<'a> {
    pub device: &'a dyn GfxDevice,
    pub scene: &'a mut dyn SceneManager,
    pub camera: &'a mut CameraManager,
    pub tlas_builder: &'a mut TlasBuilder,
    pub retired: &'a mut RetiredResources,
    /// 即将渲染的帧
    pub frame_id: u64,
}

impl JobKind {
    pub fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        match self {
            Self::UpdateTransforms => ctx.scene.update_world_transforms()?,
            Self::BuildGeometry(geometry) => ctx.scene.build_geometry(ctx.device, *geometry)?,
            Self::UploadTexture(texture) => ctx.scene.upload_texture(ctx.device, *texture)?,
            Self::UpdateMaterials(target) => ctx.scene.update_materials(ctx.device, target.materials())?,
            Self::UpdateRenderParameters => ctx.camera.refresh(&*ctx.scene),
            Self::UpdateInstanceBuffer => ctx.scene.update_instance_buffer(ctx.device)?,
            Self::UpdateEmitters => ctx.scene.update_emitters(ctx.device)?,
            Self::BuildTlas => ctx
                .tlas_builder
                .rebuild(ctx.device, &mut *ctx.scene, ctx.retired, ctx.frame_id)
                .map_err(JobError::Tlas)?,
            Self::ReclaimExpiredResources => {
                ctx.retired.reclaim(ctx.device, ctx.frame_id);
            }
        }
        Ok(())
    }

    /// 失败或被跳过的 job 需要在下一帧重新执行
    ///
    /// 把涉及的组件放回场景的脏列表，返回需要重新标记的脏类别
    pub fn requeue(&self, scene: &mut dyn SceneManager) -> DirtySet {
        match self {
            Self::UpdateTransforms => DirtySet::TRANSFORM,
            Self::BuildGeometry(geometry) => {
                scene.requeue_dirty_geometry(*geometry);
                DirtySet::GEOMETRY
            }
            Self::UploadTexture(texture) => {
                scene.requeue_dirty_texture(*texture);
                DirtySet::TEXTURE
            }
            // 没有脏 texture 的 TEXTURE 标记同样会重建全部 material
            Self::UpdateMaterials(MaterialTarget::All(_)) => DirtySet::TEXTURE,
            Self::UpdateMaterials(MaterialTarget::Dirty(materials)) => {
                materials.iter().for_each(|m| scene.requeue_dirty_material(*m));
                DirtySet::MATERIAL
            }
            Self::UpdateRenderParameters => DirtySet::CAMERA,
            Self::UpdateInstanceBuffer | Self::BuildTlas => DirtySet::ENTITY,
            Self::UpdateEmitters => DirtySet::LIGHT,
            Self::ReclaimExpiredResources => DirtySet::NONE,
        }
    }
}

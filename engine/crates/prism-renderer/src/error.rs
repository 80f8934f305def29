use prism_gfx::error::GfxError;
use prism_scene::error::SceneError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("no window surface")]
    NoSurface,

    #[error("surface reports no supported format")]
    NoSurfaceFormat,

    #[error("failed to create {what}: {source}")]
    ResourceCreation {
        what: &'static str,
        #[source]
        source: GfxError,
    },

    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error(transparent)]
    Scene(#[from] SceneError),
}

pub type RendererResult<T> = Result<T, RendererError>;

/// 给 [`GfxError`] 附加上正在创建的资源名
pub(crate) trait CreationContext<T> {
    fn creating(self, what: &'static str) -> RendererResult<T>;
}

impl<T> CreationContext<T> for Result<T, GfxError> {
    #[inline]
    fn creating(self, what: &'static str) -> RendererResult<T> {
        self.map_err(|source| RendererError::ResourceCreation { what, source })
    }
}

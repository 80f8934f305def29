use prism_gfx::error::GfxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SceneError {
    #[error(transparent)]
    Gfx(#[from] GfxError),

    /// 句柄在 job 创建之后被移除
    #[error("stale {0} handle")]
    StaleHandle(&'static str),
}

pub type SceneResult<T> = Result<T, SceneError>;

use ash::vk;
use thiserror::Error;

/// 设备操作的错误
///
/// 所有可能失败的设备调用都返回 [`GfxResult`]，由调用方就近处理。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GfxError {
    /// Vulkan 调用返回了错误码
    #[error("`{call}` failed: {result}")]
    Vulkan { call: &'static str, result: vk::Result },

    /// 句柄已经失效（资源已被销毁或从未创建）
    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),

    /// 等待 fence 超时
    #[error("wait timed out after {timeout_ns} ns")]
    Timeout { timeout_ns: u64 },

    #[error("device lost")]
    DeviceLost,
}

pub type GfxResult<T> = Result<T, GfxError>;

impl GfxError {
    #[inline]
    pub fn vk(call: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::TIMEOUT => Self::Timeout { timeout_ns: 0 },
            _ => Self::Vulkan { call, result },
        }
    }

    /// 是否是显存/内存不足
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::Vulkan {
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                ..
            }
        )
    }
}

//! Prism 的 GFX 边界
//!
//! 帧调度核心不直接持有任何 Vulkan 对象，所有 GPU 资源都以 [`handles`] 中的
//! 代际句柄表示，具体的创建、销毁、提交由 [`device::GfxDevice`] 的实现负责。
//!
//! - [`commands`]：image 状态、barrier、命令录制与提交描述
//! - [`descriptors`]：descriptor 写入以及按资源类别划分的 descriptor 管理接口
//! - [`swapchain`]：surface 能力、swapchain 参数选择
//! - [`null_device`]：不依赖 GPU 的设备实现，记录所有调用，用于无头运行与测试

pub mod commands;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod handles;
pub mod null_device;
pub mod swapchain;

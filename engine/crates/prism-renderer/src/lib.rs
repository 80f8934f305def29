//! 光追帧调度
//!
//! 每帧的流程：
//! 1. 根据 [`prism_scene::dirty::DirtyTracker`] 中积累的脏标记构建 [`jobs::job_graph::JobGraph`] 并执行
//! 2. [`renderer::Renderer::render_frame`] 等待 ring slot、录制命令、提交、呈现、统计时间
//!
//! GPU 访问全部经过 [`prism_gfx::device::GfxDevice`]。

pub mod config;
pub mod error;
pub mod frame_counter;
pub mod frame_ring;
pub mod jobs;
pub mod readback;
pub mod renderer;
pub mod retired;
pub mod swapchain_manager;
pub mod timing;
pub mod tlas;

#[cfg(test)]
pub(crate) mod test_utils;

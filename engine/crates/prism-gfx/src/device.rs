//! 设备接口
//!
//! 帧调度通过 `Arc<dyn GfxDevice>` 访问 GPU。接口只接收 `&self`，
//! 实现需要自行保证内部同步，以便 surface 的替换可以在其他线程发生。

use ash::vk;

use crate::{
    commands::{command::GfxCommand, submit_info::GfxSubmitInfo},
    descriptors::{GfxDescriptorSetLayout, GfxDescriptorWrite, ResourceClass},
    error::GfxResult,
    handles::*,
    swapchain::{GfxAcquireResult, GfxPresentResult, GfxSurfaceCapabilities, GfxSwapchainCreateInfo},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxImageCreateInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub debug_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxBufferCreateInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// 是否需要 host 可见，用于 readback
    pub host_visible: bool,
    pub debug_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GfxPipelineCreateInfo {
    RayTracing {
        shader_stages: Vec<&'static str>,
        max_recursion_depth: u32,
        /// set 1.. 使用的 bindless descriptor
        bindless_classes: Vec<ResourceClass>,
        push_constant_size: u32,
    },
    Display {
        color_format: vk::Format,
        push_constant_size: u32,
    },
}

/// 构建 BLAS 的三角形几何
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxBlasGeometry {
    pub vertex_buffer: GfxBufferHandle,
    pub vertex_count: u32,
    pub index_buffer: GfxBufferHandle,
    pub index_count: u32,
}

/// TLAS 中的一个实例
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GfxTlasInstance {
    pub blas: GfxAccelerationHandle,
    pub transform: glam::Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_record_offset: u32,
}

pub trait GfxDevice: Send + Sync {
    // ------------------------------ image & buffer ------------------------------
    fn create_image(&self, info: &GfxImageCreateInfo) -> GfxResult<GfxImageHandle>;
    fn destroy_image(&self, image: GfxImageHandle);

    fn create_buffer(&self, info: &GfxBufferCreateInfo) -> GfxResult<GfxBufferHandle>;
    fn destroy_buffer(&self, buffer: GfxBufferHandle);
    /// 读取 host 可见 buffer 的全部内容
    fn read_buffer(&self, buffer: GfxBufferHandle) -> GfxResult<Vec<u8>>;

    // ------------------------------ sync ------------------------------
    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<GfxFenceHandle>;
    fn destroy_fence(&self, fence: GfxFenceHandle);
    fn wait_for_fence(&self, fence: GfxFenceHandle, timeout_ns: u64) -> GfxResult<()>;
    fn reset_fence(&self, fence: GfxFenceHandle) -> GfxResult<()>;

    fn create_semaphore(&self, debug_name: &str) -> GfxResult<GfxSemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: GfxSemaphoreHandle);

    // ------------------------------ commands ------------------------------
    fn allocate_command_buffers(&self, count: usize, debug_name: &str) -> GfxResult<Vec<GfxCommandBufferHandle>>;
    fn free_command_buffers(&self, command_buffers: &[GfxCommandBufferHandle]);
    /// 重置 command buffer 并录制命令
    fn record_commands(&self, command_buffer: GfxCommandBufferHandle, commands: &[GfxCommand]) -> GfxResult<()>;
    fn submit(&self, submit_info: &GfxSubmitInfo, fence: Option<GfxFenceHandle>) -> GfxResult<()>;
    fn wait_idle(&self) -> GfxResult<()>;

    // ------------------------------ descriptors ------------------------------
    fn allocate_descriptor_sets(&self, layouts: &[GfxDescriptorSetLayout]) -> GfxResult<Vec<GfxDescriptorSetHandle>>;
    fn allocate_bindless_set(&self, class: ResourceClass, capacity: u32) -> GfxResult<GfxDescriptorSetHandle>;
    fn free_descriptor_sets(&self, sets: &[GfxDescriptorSetHandle]);
    fn write_descriptors(&self, writes: &[GfxDescriptorWrite]);

    // ------------------------------ query ------------------------------
    fn create_query_pool(&self, query_count: u32, debug_name: &str) -> GfxResult<GfxQueryPoolHandle>;
    fn destroy_query_pool(&self, pool: GfxQueryPoolHandle);
    /// `first_query` 与 `first_query + 1` 两个 timestamp 之间的毫秒数
    ///
    /// 结果尚不可用且 `wait` 为 false，或者 query 从未被写入时，返回 `None`
    fn query_time_elapsed(&self, pool: GfxQueryPoolHandle, first_query: u32, wait: bool) -> GfxResult<Option<f64>>;

    // ------------------------------ pipeline ------------------------------
    fn create_pipeline(&self, info: &GfxPipelineCreateInfo) -> GfxResult<GfxPipelineHandle>;
    fn destroy_pipeline(&self, pipeline: GfxPipelineHandle);

    // ------------------------------ acceleration ------------------------------
    fn build_blas(&self, geometry: &GfxBlasGeometry, debug_name: &str) -> GfxResult<GfxAccelerationHandle>;
    fn build_tlas(&self, instances: &[GfxTlasInstance], debug_name: &str) -> GfxResult<GfxAccelerationHandle>;
    fn destroy_acceleration(&self, acceleration: GfxAccelerationHandle);

    // ------------------------------ swapchain ------------------------------
    fn surface_capabilities(&self, surface: GfxSurfaceHandle) -> GfxResult<GfxSurfaceCapabilities>;
    /// 创建 swapchain，`old_swapchain` 会作为 `oldSwapchain` 传入，调用方随后负责销毁它
    fn create_swapchain(
        &self,
        info: &GfxSwapchainCreateInfo,
        old_swapchain: Option<GfxSwapchainHandle>,
    ) -> GfxResult<GfxSwapchainHandle>;
    fn destroy_swapchain(&self, swapchain: GfxSwapchainHandle);
    fn swapchain_images(&self, swapchain: GfxSwapchainHandle) -> GfxResult<Vec<GfxImageHandle>>;
    fn acquire_next_image(
        &self,
        swapchain: GfxSwapchainHandle,
        semaphore: GfxSemaphoreHandle,
        timeout_ns: u64,
    ) -> GfxResult<GfxAcquireResult>;
    fn present(
        &self,
        swapchain: GfxSwapchainHandle,
        image_index: u32,
        wait_semaphores: &[GfxSemaphoreHandle],
    ) -> GfxResult<GfxPresentResult>;
}

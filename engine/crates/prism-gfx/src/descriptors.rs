//! descriptor 相关的描述与接口

use ash::vk;

use crate::{
    device::GfxDevice,
    error::GfxResult,
    handles::{GfxAccelerationHandle, GfxBufferHandle, GfxDescriptorSetHandle, GfxImageHandle},
};

/// shader 中的 binding 编号
pub mod binding {
    // display set
    pub const DISPLAY_BUFFER: u32 = 0;

    // render set
    pub const TLAS: u32 = 0;
    pub const RENDER_BUFFER: u32 = 1;
    pub const PREV_RENDER_BUFFER: u32 = 2;
    pub const INSTANCES: u32 = 3;
    pub const MATERIALS: u32 = 4;
    pub const EMITTERS: u32 = 5;
}

/// 帧内 descriptor set 的布局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxDescriptorSetLayout {
    /// display pass 采样 render target
    Display,
    /// 光追 pass 使用的 TLAS、render target 以及场景 buffer
    Render,
}

/// 按资源类别划分的 bindless descriptor，由 [`DescriptorManager`] 管理
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    AttributeBuffer,
    IndexBuffer,
    TextureImage,
}

impl ResourceClass {
    /// 光追 pipeline 中 set 1..=3 的顺序
    pub const ALL: [ResourceClass; 3] = [Self::AttributeBuffer, Self::IndexBuffer, Self::TextureImage];

    #[inline]
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::AttributeBuffer | Self::IndexBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::TextureImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxDescriptorResource {
    Acceleration(GfxAccelerationHandle),
    StorageBuffer(GfxBufferHandle),
    StorageImage {
        image: GfxImageHandle,
        layout: vk::ImageLayout,
    },
    SampledImage {
        image: GfxImageHandle,
        layout: vk::ImageLayout,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxDescriptorWrite {
    pub set: GfxDescriptorSetHandle,
    pub binding: u32,
    pub resource: GfxDescriptorResource,
}

impl GfxDescriptorWrite {
    #[inline]
    pub fn new(set: GfxDescriptorSetHandle, binding: u32, resource: GfxDescriptorResource) -> Self {
        Self { set, binding, resource }
    }
}

/// 管理按 [`ResourceClass`] 划分的 descriptor pool 与 set
///
/// 场景中的 geometry、texture 在上传时把自己写入这些 set，帧调度只负责在光追时绑定它们。
pub trait DescriptorManager: Send {
    fn create_descriptor_pool(&mut self, device: &dyn GfxDevice, class: ResourceClass, capacity: u32)
    -> GfxResult<()>;

    fn descriptor_set(&self, class: ResourceClass) -> Option<GfxDescriptorSetHandle>;

    fn destroy_all_descriptor_pools(&mut self, device: &dyn GfxDevice);
}

/// 每个资源类别一个 set 的 descriptor 管理
#[derive(Default)]
pub struct ClassDescriptorManager {
    sets: Vec<(ResourceClass, GfxDescriptorSetHandle, u32)>,
}

impl ClassDescriptorManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn capacity(&self, class: ResourceClass) -> Option<u32> {
        self.sets.iter().find(|(c, _, _)| *c == class).map(|(_, _, capacity)| *capacity)
    }
}

impl DescriptorManager for ClassDescriptorManager {
    fn create_descriptor_pool(
        &mut self,
        device: &dyn GfxDevice,
        class: ResourceClass,
        capacity: u32,
    ) -> GfxResult<()> {
        if self.descriptor_set(class).is_some() {
            log::warn!("descriptor pool for {:?} already exists", class);
            return Ok(());
        }
        let set = device.allocate_bindless_set(class, capacity)?;
        self.sets.push((class, set, capacity));
        log::debug!("descriptor pool created: {:?}, {:?} x {}", class, class.descriptor_type(), capacity);
        Ok(())
    }

    fn descriptor_set(&self, class: ResourceClass) -> Option<GfxDescriptorSetHandle> {
        self.sets.iter().find(|(c, _, _)| *c == class).map(|(_, set, _)| *set)
    }

    fn destroy_all_descriptor_pools(&mut self, device: &dyn GfxDevice) {
        let sets = self.sets.drain(..).map(|(_, set, _)| set).collect::<Vec<_>>();
        device.free_descriptor_sets(&sets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null_device::NullDevice;

    #[test]
    fn one_set_per_class() {
        let device = NullDevice::new();
        let mut manager = ClassDescriptorManager::new();
        for class in ResourceClass::ALL {
            manager.create_descriptor_pool(&device, class, 1024).unwrap();
        }
        manager.create_descriptor_pool(&device, ResourceClass::IndexBuffer, 8).unwrap();

        assert_eq!(manager.capacity(ResourceClass::IndexBuffer), Some(1024));
        assert_ne!(
            manager.descriptor_set(ResourceClass::AttributeBuffer),
            manager.descriptor_set(ResourceClass::TextureImage)
        );

        manager.destroy_all_descriptor_pools(&device);
        assert!(manager.descriptor_set(ResourceClass::AttributeBuffer).is_none());
        assert_eq!(device.live_descriptor_sets(), 0);
    }
}

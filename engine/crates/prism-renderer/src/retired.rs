//! 延迟销毁
//!
//! 被替换下来的 GPU 资源可能仍被在途帧引用，需要等到提交时的帧已经确定完成之后才能销毁。

use prism_gfx::{
    device::GfxDevice,
    handles::{GfxAccelerationHandle, GfxBufferHandle, GfxImageHandle},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetiredResource {
    Acceleration(GfxAccelerationHandle),
    Buffer(GfxBufferHandle),
    Image(GfxImageHandle),
}

impl RetiredResource {
    fn destroy(self, device: &dyn GfxDevice) {
        match self {
            Self::Acceleration(acceleration) => device.destroy_acceleration(acceleration),
            Self::Buffer(buffer) => device.destroy_buffer(buffer),
            Self::Image(image) => device.destroy_image(image),
        }
    }
}

pub struct RetiredResources {
    /// (resource, frame_id)
    pending_destroy: Vec<(RetiredResource, u64)>,
    fif_count: u64,
}

// new & init
impl RetiredResources {
    pub fn new(fif_count: usize) -> Self {
        Self {
            pending_destroy: Vec::new(),
            fif_count: fif_count as u64,
        }
    }
}

// getters
impl RetiredResources {
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending_destroy.len()
    }
}

// update
impl RetiredResources {
    /// 在 `frame_id` 这一帧退役的资源
    #[inline]
    pub fn retire(&mut self, resource: RetiredResource, frame_id: u64) {
        self.pending_destroy.push((resource, frame_id));
    }

    /// 销毁那些已经不再被 GPU 使用的资源（即退役时的帧 + FIF <= 当前帧）
    ///
    /// 返回销毁的数量
    pub fn reclaim(&mut self, device: &dyn GfxDevice, current_frame_id: u64) -> usize {
        let _span = tracy_client::span!("RetiredResources::reclaim");
        let fif = self.fif_count;
        let before = self.pending_destroy.len();
        self.pending_destroy.retain(|(resource, frame_id)| {
            if *frame_id + fif <= current_frame_id {
                resource.destroy(device);
                false
            } else {
                true
            }
        });
        let reclaimed = before - self.pending_destroy.len();
        if reclaimed > 0 {
            log::debug!("reclaimed {} retired resources", reclaimed);
        }
        reclaimed
    }
}

// destroy
impl RetiredResources {
    /// 设备 idle 之后调用，立即销毁全部
    pub fn destroy_all(&mut self, device: &dyn GfxDevice) {
        for (resource, _) in self.pending_destroy.drain(..) {
            resource.destroy(device);
        }
    }
}

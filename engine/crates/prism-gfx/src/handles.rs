//! GPU 对象句柄
//!
//! 句柄由 slot index + generation 组成，资源被销毁后旧句柄会失效，
//! 不会指向新分配在同一位置的资源。

use slotmap::new_key_type;

new_key_type! { pub struct GfxImageHandle; }
new_key_type! { pub struct GfxBufferHandle; }
new_key_type! { pub struct GfxFenceHandle; }
new_key_type! { pub struct GfxSemaphoreHandle; }
new_key_type! { pub struct GfxCommandBufferHandle; }
new_key_type! { pub struct GfxDescriptorSetHandle; }
new_key_type! { pub struct GfxQueryPoolHandle; }
new_key_type! { pub struct GfxPipelineHandle; }
new_key_type! { pub struct GfxSurfaceHandle; }
new_key_type! { pub struct GfxSwapchainHandle; }
new_key_type! { pub struct GfxAccelerationHandle; }

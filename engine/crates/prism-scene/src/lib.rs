//! 帧调度所依赖的场景侧接口
//!
//! 场景数据的存储与变换计算不属于帧调度，这里只定义帧调度需要的协作接口
//! [`scene_manager::SceneManager`]、[`settings::RenderSettings`]，以及在两者之间传递的数据：
//! 脏标记、渲染参数、相机参数。
//!
//! [`memory_scene::MemoryScene`] 是一个完全在内存中的场景实现，用于无头运行与测试。

pub mod camera;
pub mod dirty;
pub mod error;
pub mod ids;
pub mod memory_scene;
pub mod params;
pub mod scene_manager;
pub mod settings;

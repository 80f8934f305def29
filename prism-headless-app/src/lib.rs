//! 在 NullDevice 上驱动帧调度，模拟窗口尺寸变化、最小化以及 surface 替换

pub mod app;
pub mod cornell;

//! 每帧的更新任务
//!
//! 脏标记先被翻译成一张 [`job_graph::JobGraph`]，再按依赖顺序执行。

pub mod job;
pub mod job_graph;

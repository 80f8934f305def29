//! 帧时间统计
//!
//! CPU 时间是一帧 `render_frame` 的墙钟时间；GPU 时间来自上一帧的 timestamp query，
//! 因此第 F 帧的 GPU 时间在第 F+1 帧测量时才被记录。

use std::{collections::VecDeque, time::Instant};

/// 固定窗口的滑动平均
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<f64>,
    window: usize,
    sum: f64,
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.window
            && let Some(oldest) = self.samples.pop_front()
        {
            self.sum -= oldest;
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// 没有样本时为 0
    #[inline]
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() { 0.0 } else { self.sum / self.samples.len() as f64 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

/// 某一时刻的统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingSnapshot {
    pub cpu_avg_ms: f64,
    pub gpu_avg_ms: f64,
    /// 自上次重置累积以来经过的墙钟时间
    pub total_elapsed_ms: f64,
    /// 自上次重置累积以来参与累积渲染的帧数，与 `Renderer::frame_number` 一致
    pub frame_count: u64,
}

#[derive(Debug)]
pub struct TimingAggregator {
    cpu: RollingAverage,
    gpu: RollingAverage,
    progress_start: Instant,
    frame_count: u64,
}

// new & init
impl TimingAggregator {
    pub fn new(window: usize) -> Self {
        Self {
            cpu: RollingAverage::new(window),
            gpu: RollingAverage::new(window),
            progress_start: Instant::now(),
            frame_count: 0,
        }
    }
}

// update
impl TimingAggregator {
    /// 记录一帧
    ///
    /// `gpu_ms` 为负数表示没有可用的 GPU 时间，不计入平均值。
    /// 场景没有就绪的帧（`rendered` 为 false）只计入时间，不计入帧数。
    pub fn record_frame(&mut self, cpu_ms: f64, gpu_ms: f64, rendered: bool) {
        self.cpu.push(cpu_ms);
        if gpu_ms >= 0.0 {
            self.gpu.push(gpu_ms);
        }
        if rendered {
            self.frame_count += 1;
        }
    }

    /// 累积渲染被重置时调用
    pub fn reset_progress(&mut self) {
        self.progress_start = Instant::now();
        self.frame_count = 0;
    }
}

// getters
impl TimingAggregator {
    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            cpu_avg_ms: self.cpu.average(),
            gpu_avg_ms: self.gpu.average(),
            total_elapsed_ms: self.progress_start.elapsed().as_secs_f64() * 1000.0,
            frame_count: self.frame_count,
        }
    }

    #[inline]
    pub fn gpu_sample_count(&self) -> usize {
        self.gpu.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_average_drops_oldest() {
        let mut avg = RollingAverage::new(2);
        assert_eq!(avg.average(), 0.0);
        avg.push(1.0);
        avg.push(3.0);
        assert_eq!(avg.average(), 2.0);
        avg.push(5.0);
        assert_eq!(avg.len(), 2);
        assert_eq!(avg.average(), 4.0);
    }

    #[test]
    fn negative_gpu_time_is_ignored() {
        let mut timing = TimingAggregator::new(4);
        timing.record_frame(10.0, -1.0, true);
        timing.record_frame(20.0, 4.0, true);

        let snapshot = timing.snapshot();
        assert_eq!(snapshot.cpu_avg_ms, 15.0);
        assert_eq!(snapshot.gpu_avg_ms, 4.0);
        assert_eq!(snapshot.frame_count, 2);
        assert_eq!(timing.gpu_sample_count(), 1);

        timing.reset_progress();
        assert_eq!(timing.snapshot().frame_count, 0);
        // 重置累积不影响滑动平均
        assert_eq!(timing.snapshot().cpu_avg_ms, 15.0);
    }

    #[test]
    fn frames_without_render_iteration_are_not_counted() {
        let mut timing = TimingAggregator::new(4);
        timing.record_frame(1.0, 1.0, false);
        timing.record_frame(3.0, 1.0, true);

        let snapshot = timing.snapshot();
        assert_eq!(snapshot.frame_count, 1);
        assert_eq!(snapshot.cpu_avg_ms, 2.0);
        assert_eq!(timing.gpu_sample_count(), 2);
    }
}

// 設定管理の具象実装

use crate::core::PipelineConfig;

/// デフォルト設定実装
#[derive(Debug, Clone)]
pub struct DefaultPipelineConfig {
    capacity: usize,
    worker_count: usize,
    buffer_size: usize,
    enable_progress: bool,
}

impl DefaultPipelineConfig {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            capacity: 20,
            worker_count: cpu_count.max(1),
            buffer_size: 100,
            enable_progress: true,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_progress_reporting(mut self, enable: bool) -> Self {
        self.enable_progress = enable;
        self
    }
}

impl Default for DefaultPipelineConfig {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl PipelineConfig for DefaultPipelineConfig {
    fn pipeline_capacity(&self) -> usize {
        self.capacity
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn channel_buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn enable_progress_reporting(&self) -> bool {
        self.enable_progress
    }
}

use rayon::ThreadPoolBuilder;
use crate::config::settings::{PerformanceProfile, ViewerSettings};

/// Sizing of the texture decode worker pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub decode_threads: usize,
    pub stack_size: Option<usize>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            decode_threads: (num_cpus / 2).max(1),
            stack_size: Some(2 * 1024 * 1024), // 2MB stack size
        }
    }
}

impl ThreadPoolConfig {
    /// Derive the pool size from the active settings and the core count.
    pub fn for_profile(settings: &ViewerSettings, cpu_cores: usize) -> Self {
        if settings.fetch.decode_threads > 0 {
            return Self {
                decode_threads: settings.fetch.decode_threads,
                ..Self::default()
            };
        }

        match settings.profile {
            PerformanceProfile::Low => Self {
                decode_threads: 1,
                stack_size: Some(1024 * 1024),
            },
            PerformanceProfile::Balanced => Self {
                decode_threads: (cpu_cores / 2).max(1),
                stack_size: Some(2 * 1024 * 1024),
            },
            PerformanceProfile::High => Self {
                decode_threads: cpu_cores.saturating_sub(1).max(1),
                stack_size: Some(4 * 1024 * 1024), // large J2C/PNG frames
            },
            PerformanceProfile::Custom => Self::default(),
        }
    }

    /// Build the bounded rayon pool that decodes fetched images.
    pub fn build_pool(&self) -> anyhow::Result<rayon::ThreadPool> {
        tracing::info!("Initializing decode pool with config: {:?}", self);

        let mut builder = ThreadPoolBuilder::new()
            .num_threads(self.decode_threads)
            .thread_name(|index| format!("slv-decode-{}", index));

        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create decode thread pool: {}", e))
    }
}

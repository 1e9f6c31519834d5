use tracing::warn;

/// Emulation accuracy level the surrounding settings system hands down.
/// Only [`High`](GpuAccuracy::High) and above enqueue deferred downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum GpuAccuracy {
    Normal,
    #[default]
    High,
    Extreme,
}

impl GpuAccuracy {
    pub fn is_high(self) -> bool {
        self >= GpuAccuracy::High
    }
}

/// Settings consumed by the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub gpu_accuracy: GpuAccuracy,
    /// Deferred downloads are only enqueued when the GPU runs on its own
    /// thread; synchronous emulation flushes inline instead.
    pub use_asynchronous_gpu_emulation: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gpu_accuracy: GpuAccuracy::default(),
            use_asynchronous_gpu_emulation: true,
        }
    }
}

impl CacheConfig {
    const ACCURACY_VAR: &'static str = "GPU_BUFFER_CACHE_ACCURACY";
    const ASYNC_VAR: &'static str = "GPU_BUFFER_CACHE_ASYNC";

    /// Defaults with environment overrides, so accuracy can be tuned in a
    /// deployment without code changes. Unparsable values are ignored with a
    /// warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(raw) = read_env(Self::ACCURACY_VAR) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "normal" => config.gpu_accuracy = GpuAccuracy::Normal,
                "high" => config.gpu_accuracy = GpuAccuracy::High,
                "extreme" => config.gpu_accuracy = GpuAccuracy::Extreme,
                _ => warn!(
                    env_var = Self::ACCURACY_VAR,
                    value = %raw,
                    "Ignoring unknown accuracy level"
                ),
            }
        }
        if let Some(raw) = read_env(Self::ASYNC_VAR) {
            match raw.trim() {
                "1" | "true" => config.use_asynchronous_gpu_emulation = true,
                "0" | "false" => config.use_asynchronous_gpu_emulation = false,
                _ => warn!(
                    env_var = Self::ASYNC_VAR,
                    value = %raw,
                    "Ignoring value that is not a boolean"
                ),
            }
        }
        config
    }
}

fn read_env(var: &'static str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) => Some(value),
        Err(std::env::VarError::NotPresent) => None,
        Err(std::env::VarError::NotUnicode(_)) => {
            warn!(env_var = var, "Ignoring {var} because it is not valid unicode");
            None
        }
    }
}

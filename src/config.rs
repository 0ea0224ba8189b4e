use std::str::FromStr;

const ENV_PREFIX: &str = "WGPU_ARRAY_";

/// Which graph rewrites run before a lazy array is materialized.
///
/// Operand canonicalization is not listed here: every other pass depends on
/// it, so it always runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptimizerConfig {
    pub viewop_pruning: bool,
    pub constant_folding: bool,
    pub elementwise_fusion: bool,
    pub processing_fusion: bool,
}

impl OptimizerConfig {
    /// Every pass enabled. Produces the fewest kernel launches.
    pub const fn minimal_kernels() -> Self {
        Self {
            viewop_pruning: true,
            constant_folding: true,
            elementwise_fusion: true,
            processing_fusion: true,
        }
    }

    /// Every optional pass disabled. One kernel per graph node.
    pub const fn disabled() -> Self {
        Self {
            viewop_pruning: false,
            constant_folding: false,
            elementwise_fusion: false,
            processing_fusion: false,
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_value("OPT_VIEWOP_PRUNING") {
            config.viewop_pruning = value;
        }
        if let Some(value) = env_value("OPT_CONSTANT_FOLDING") {
            config.constant_folding = value;
        }
        if let Some(value) = env_value("OPT_ELEMENTWISE_FUSION") {
            config.elementwise_fusion = value;
        }
        if let Some(value) = env_value("OPT_PROCESSING_FUSION") {
            config.processing_fusion = value;
        }
        config
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::minimal_kernels()
    }
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Build a deferred graph instead of dispatching every operation immediately.
    pub lazy: bool,
    pub optimizer: OptimizerConfig,
    pub power_preference: wgpu::PowerPreference,
    /// Skip hardware adapters and go straight to the software fallback.
    pub force_fallback_adapter: bool,
    /// Upper bound on the reduction work-group size, below the adapter limit.
    pub max_workgroup_size: Option<u32>,
    /// Seed of the generator behind `uniform` and `normal`.
    pub seed: u64,
    /// Log node counts after each optimizer pass and the graphviz dump.
    pub log_graph: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            lazy: true,
            optimizer: OptimizerConfig::default(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            max_workgroup_size: None,
            seed: 0,
            log_graph: false,
        }
    }
}

impl DeviceConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            optimizer: OptimizerConfig::from_env(),
            ..Self::default()
        };
        if let Some(lazy) = env_value("LAZY") {
            config.lazy = lazy;
        }
        if let Some(fallback) = env_value("FALLBACK_ADAPTER") {
            config.force_fallback_adapter = fallback;
        }
        if let Some(log_graph) = env_value("GRAPH") {
            config.log_graph = log_graph;
        }
        if let Some(seed) = env_value("SEED") {
            config.seed = seed;
        }
        if let Some(size) = env_value::<u32>("MAX_WORKGROUP_SIZE") {
            config.max_workgroup_size = Some(size);
        }
        config
    }

    pub fn eager() -> Self {
        Self {
            lazy: false,
            ..Self::default()
        }
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }
}

trait EnvValue: Sized {
    fn parse_env(value: &str) -> Option<Self>;
}

impl EnvValue for bool {
    fn parse_env(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        }
    }
}

macro_rules! numeric_env_value {
    ($($ty:ty),*) => {
        $(
            impl EnvValue for $ty {
                fn parse_env(value: &str) -> Option<Self> {
                    <$ty>::from_str(value.trim()).ok()
                }
            }
        )*
    };
}

numeric_env_value!(u32, u64);

fn env_value<T: EnvValue>(name: &str) -> Option<T> {
    let key = format!("{ENV_PREFIX}{name}");
    let raw = std::env::var(&key).ok()?;
    let parsed = T::parse_env(&raw);
    if parsed.is_none() {
        log::warn!("ignoring {key}={raw:?}: could not parse value");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flags() {
        assert_eq!(bool::parse_env("1"), Some(true));
        assert_eq!(bool::parse_env(" Off "), Some(false));
        assert_eq!(bool::parse_env("maybe"), None);
        assert_eq!(u32::parse_env("64"), Some(64));
        assert_eq!(u64::parse_env("-3"), None);
    }

    #[test]
    fn defaults_enable_every_pass() {
        let config = DeviceConfig::default();
        assert!(config.lazy);
        assert_eq!(config.optimizer, OptimizerConfig::minimal_kernels());
        assert_eq!(config.seed, 0);

        let eager = DeviceConfig::eager().with_optimizer(OptimizerConfig::disabled());
        assert!(!eager.lazy);
        assert!(!eager.optimizer.elementwise_fusion);
    }
}

use crate::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use stowage_core::ResourceQuantities;
use tracing::warn;

/// RAM kept free on every node when the configured buffer cannot be parsed
pub const DEFAULT_RAM_SAFETY_BUFFER: &str = "512Mi";

/// Placement strategy to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StrategyName {
    /// Most available RAM first
    EvenLoad,
    /// Fewest remaining same-sized spots first
    EvenLoadSpots,
    /// Pack regular workspaces densely while spreading startups
    #[default]
    DensityAndExperience,
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyName::EvenLoad => "EvenLoad",
            StrategyName::EvenLoadSpots => "EvenLoadSpots",
            StrategyName::DensityAndExperience => "DensityAndExperience",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for StrategyName {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EvenLoad" => Ok(StrategyName::EvenLoad),
            "EvenLoadSpots" => Ok(StrategyName::EvenLoadSpots),
            "DensityAndExperience" => Ok(StrategyName::DensityAndExperience),
            other => Err(SchedulerError::invalid_config(
                format!("unknown strategy '{}'", other),
                "Use one of EvenLoad, EvenLoadSpots or DensityAndExperience",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DensityAndExperienceConfig {
    /// Workspaces younger than this count as "fresh"
    pub workspace_fresh_period_seconds: u64,
    /// Nodes with this many fresh workspaces are skipped for regular workspaces
    pub node_fresh_workspace_limit: usize,
}

impl Default for DensityAndExperienceConfig {
    fn default() -> Self {
        Self {
            workspace_fresh_period_seconds: 120,
            node_fresh_workspace_limit: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Upper bound on scheduling attempts per second
    pub max_rps: u32,
}

/// Configuration for the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Pods must set `spec.schedulerName` to this
    pub scheduler_name: String,
    /// Only pods in this namespace are scheduled
    pub namespace: String,
    /// Base node label selector, merged with each pod's node selector
    pub node_label_selector: BTreeMap<String, String>,
    pub strategy_name: StrategyName,
    pub density_and_experience_config: DensityAndExperienceConfig,
    /// Memory kept free on every node, in quantity notation
    pub ram_safety_buffer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    pub reschedule_interval_seconds: u64,
    pub queue_initial_backoff_millis: u64,
    pub queue_maximum_backoff_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "workspace-scheduler".to_string(),
            namespace: "default".to_string(),
            node_label_selector: BTreeMap::new(),
            strategy_name: StrategyName::default(),
            density_and_experience_config: DensityAndExperienceConfig::default(),
            ram_safety_buffer: DEFAULT_RAM_SAFETY_BUFFER.to_string(),
            rate_limit: None,
            reschedule_interval_seconds: 2,
            queue_initial_backoff_millis: 1000,
            queue_maximum_backoff_millis: 4000,
        }
    }
}

impl SchedulerConfig {
    /// Load a configuration file. `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::invalid_config(
                format!("cannot read {}: {}", path.display(), e),
                "Check that the configuration file exists and is readable",
            )
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config: Self = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                SchedulerError::invalid_config(
                    format!("cannot parse {}: {}", path.display(), e),
                    "Fix the JSON syntax or the offending field",
                )
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| {
                SchedulerError::invalid_config(
                    format!("cannot parse {}: {}", path.display(), e),
                    "Fix the YAML syntax or the offending field",
                )
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SchedulerError::internal_error(format!("cannot render config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler_name.is_empty() {
            return Err(SchedulerError::invalid_config(
                "schedulerName is empty",
                "Set schedulerName to the value pods use in spec.schedulerName",
            ));
        }
        if self.namespace.is_empty() {
            return Err(SchedulerError::invalid_config(
                "namespace is empty",
                "Set namespace to the namespace workspace pods are created in",
            ));
        }
        if self.density_and_experience_config.node_fresh_workspace_limit == 0 {
            return Err(SchedulerError::invalid_config(
                "densityAndExperienceConfig.nodeFreshWorkspaceLimit must be at least 1",
                "A limit of 0 would exclude every node; the default is 2",
            ));
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.max_rps == 0 {
                return Err(SchedulerError::invalid_config(
                    "rateLimit.maxRps must be at least 1",
                    "Remove rateLimit to schedule without a limit",
                ));
            }
        }
        if self.queue_initial_backoff_millis > self.queue_maximum_backoff_millis {
            return Err(SchedulerError::invalid_config(
                format!(
                    "queueInitialBackoffMillis ({}) exceeds queueMaximumBackoffMillis ({})",
                    self.queue_initial_backoff_millis, self.queue_maximum_backoff_millis
                ),
                "Lower the initial backoff or raise the maximum backoff",
            ));
        }
        Ok(())
    }

    /// Safety buffer in bytes, falling back to the default when unparsable
    pub fn ram_safety_buffer_bytes(&self) -> i64 {
        match ResourceQuantities::parse_memory(&self.ram_safety_buffer) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Invalid ramSafetyBuffer {:?} ({}), using {}",
                    self.ram_safety_buffer, e, DEFAULT_RAM_SAFETY_BUFFER
                );
                ResourceQuantities::parse_memory(DEFAULT_RAM_SAFETY_BUFFER).unwrap_or(512 << 20)
            }
        }
    }

    pub fn reschedule_interval(&self) -> Duration {
        Duration::from_secs(self.reschedule_interval_seconds.max(1))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.queue_initial_backoff_millis)
    }

    pub fn maximum_backoff(&self) -> Duration {
        Duration::from_millis(self.queue_maximum_backoff_millis)
    }

    /// Minimum spacing between scheduling attempts, if rate limited
    pub fn rate_limit_interval(&self) -> Option<Duration> {
        self.rate_limit
            .as_ref()
            .filter(|r| r.max_rps > 0)
            .map(|r| Duration::from_secs_f64(1.0 / f64::from(r.max_rps)))
    }
}

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::DispatchPolicy;
use crate::wire::WireConfig;

/// Tunables for a scheduling run.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use frontal::{DispatchPolicy, SchedulerConfig};
///
/// let config = SchedulerConfig::from_json(r#"{ "policy": "largest-subtree" }"#).unwrap();
/// assert_eq!(config.policy, DispatchPolicy::LargestSubtree);
/// assert!(config.check_mappings);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Order in which ready fronts are dispatched.
    pub policy: DispatchPolicy,
    /// Upper bound on fronts handed to the kernel at once. `None` means no
    /// limit beyond what the tree exposes.
    pub max_in_flight: Option<usize>,
    /// Range-check every map table when the descriptor store is built. Read
    /// by [`DescriptorStore::from_config`](crate::DescriptorStore::from_config),
    /// not by the scheduler.
    pub check_mappings: bool,
    /// Byte order of the descriptor records exchanged with the kernel. Pass it
    /// to the [`wire`](crate::wire) codecs; the scheduler never encodes records.
    pub wire: WireConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: DispatchPolicy::Fifo,
            max_in_flight: None,
            check_mappings: true,
            wire: WireConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::ZeroInFlight);
        }
        Ok(())
    }
}

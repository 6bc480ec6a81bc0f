//! Repository configuration

use serde::{Deserialize, Serialize};
use skein_common::types::tid::MAX_CLOCK_ID;

use crate::car::CarLimits;
use crate::error::{RepoError, Result};

/// Default cap on record operations in one commit
pub const DEFAULT_MAX_OPS_PER_COMMIT: usize = 200;

/// Default cap on the CAR payload of a firehose commit event
pub const DEFAULT_MAX_FIREHOSE_BLOCKS_BYTES: usize = 2_000_000;

/// Tunables for a [`Repository`](crate::Repository)
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust,ignore
/// let config = RepoConfig::from_json_str(r#"{"max_ops_per_commit": 50}"#)?;
/// let config = RepoConfig::new().clock_id(7).build();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[builder(start_fn = new)]
#[serde(default)]
pub struct RepoConfig {
    /// Most record operations accepted in a single write transaction
    #[builder(default = DEFAULT_MAX_OPS_PER_COMMIT)]
    pub max_ops_per_commit: usize,

    /// Largest `blocks` payload put on a firehose event before it is marked `tooBig`
    #[builder(default = DEFAULT_MAX_FIREHOSE_BLOCKS_BYTES)]
    pub max_firehose_blocks_bytes: usize,

    /// Bounds for reading CAR input
    #[builder(default)]
    pub car: CarLimits,

    /// Fixed TID clock id; random when unset
    pub clock_id: Option<u16>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            max_ops_per_commit: DEFAULT_MAX_OPS_PER_COMMIT,
            max_firehose_blocks_bytes: DEFAULT_MAX_FIREHOSE_BLOCKS_BYTES,
            car: CarLimits::default(),
            clock_id: None,
        }
    }
}

/// Problems with a configuration document
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ConfigError {
    /// Not valid JSON for this structure
    #[error("failed to parse repository config")]
    #[diagnostic(code(config::parse))]
    Parse(#[source] serde_json::Error),

    /// A field is out of range
    #[error("invalid value for {field}: {reason}")]
    #[diagnostic(code(config::invalid_value))]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl RepoConfig {
    /// Parse from JSON, filling unspecified fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RepoError::config(ConfigError::Parse(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason: &str| {
            Err(RepoError::config(ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            }))
        };
        if self.max_ops_per_commit == 0 {
            return invalid("max_ops_per_commit", "must be at least 1");
        }
        if self.car.max_header_size == 0 || self.car.max_block_size == 0 {
            return invalid("car", "limits must be non-zero");
        }
        if let Some(id) = self.clock_id {
            if id > MAX_CLOCK_ID {
                return invalid("clock_id", "must fit in ten bits");
            }
        }
        Ok(())
    }
}

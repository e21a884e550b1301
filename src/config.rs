//! The configuration envelope (spec.md §6).
//!
//! Grounded on the teacher's `config/mod.rs`: the same composed,
//! per-concern sub-config shape with a `validate()` pass, scaled down from
//! service/logging/performance/security sections to the executor's own
//! recognized options.

use serde::{Deserialize, Serialize};

use crate::decision_protocol::{AilMode, HilMode};
use crate::error::{ExecutorError, ExecutorResult};
use crate::replanner::DEFAULT_MAX_REPLANS;
use crate::speculation::DEFAULT_CONFIDENCE_THRESHOLD;

/// The subset of [`AilMode`] selectable through `ail.decision_points`; `off`
/// is expressed by `ail.enabled = false` instead of a fourth value here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AilDecisionPoint {
    PerLayer,
    OnError,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AilConfig {
    pub enabled: bool,
    pub decision_points: AilDecisionPoint,
}

impl AilConfig {
    pub fn effective_mode(&self) -> AilMode {
        if !self.enabled {
            return AilMode::Off;
        }
        match self.decision_points {
            AilDecisionPoint::PerLayer => AilMode::PerLayer,
            AilDecisionPoint::OnError => AilMode::OnError,
            AilDecisionPoint::Manual => AilMode::Manual,
        }
    }
}

impl Default for AilConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            decision_points: AilDecisionPoint::PerLayer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HilConfig {
    pub enabled: bool,
    pub approval_required: HilMode,
}

impl HilConfig {
    pub fn effective_mode(&self) -> HilMode {
        if !self.enabled {
            return HilMode::Never;
        }
        self.approval_required
    }
}

impl Default for HilConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            approval_required: HilMode::CriticalOnly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationConfig {
    pub enabled: bool,
    pub confidence_threshold: f64,
    pub max_concurrent: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_concurrent: 4,
        }
    }
}

impl SpeculationConfig {
    fn validate(&self) -> ExecutorResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ExecutorError::Internal(format!(
                "speculation.confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.enabled && self.max_concurrent == 0 {
            return Err(ExecutorError::Internal(
                "speculation.max_concurrent must be positive when speculation is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStreamConfig {
    pub max_buffer: usize,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self { max_buffer: 1024 }
    }
}

/// Full recognized configuration envelope (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ail: AilConfig,
    pub hil: HilConfig,
    pub speculation: SpeculationConfig,
    pub event_stream: EventStreamConfig,
    #[serde(default = "default_max_replans")]
    pub max_replans: usize,
    /// Resolution of the spec.md §9 open question: the source's default is
    /// to proceed past a hard task error to the next layer. Preserved here,
    /// with this flag as the documented opt-in for stricter behavior.
    #[serde(default)]
    pub abort_on_hard_error: bool,
}

fn default_max_replans() -> usize {
    DEFAULT_MAX_REPLANS
}

// Not `#[derive(Default)]`: that would silently fall back to
// `usize::default()` (0) for `max_replans` instead of the documented
// `DEFAULT_MAX_REPLANS`, ignoring the same constant the `serde(default)`
// attribute above already points at.
impl Default for Config {
    fn default() -> Self {
        Self {
            ail: AilConfig::default(),
            hil: HilConfig::default(),
            speculation: SpeculationConfig::default(),
            event_stream: EventStreamConfig::default(),
            max_replans: default_max_replans(),
            abort_on_hard_error: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> ExecutorResult<()> {
        self.speculation.validate()?;
        Ok(())
    }

    /// Parse a configuration envelope from its JSON representation.
    pub fn from_json(raw: &str) -> ExecutorResult<Self> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| ExecutorError::Internal(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_confidence_threshold_is_rejected() {
        let mut config = Config::default();
        config.speculation.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_ail_always_resolves_to_off() {
        let config = AilConfig {
            enabled: false,
            decision_points: AilDecisionPoint::PerLayer,
        };
        assert_eq!(config.effective_mode(), AilMode::Off);
    }

    #[test]
    fn disabled_hil_always_resolves_to_never() {
        let config = HilConfig {
            enabled: false,
            approval_required: HilMode::Always,
        };
        assert_eq!(config.effective_mode(), HilMode::Never);
    }
}

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SnapError};

/// Longest accepted interval or stagger delay, one year
pub const MAX_PERIOD_SECONDS: u64 = 365 * 24 * 60 * 60;

/// How rotation is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    #[default]
    Manual,
    Interval,
}

/// Process-wide rotation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RotationConfig {
    #[serde(default)]
    pub mode: RotationMode,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub stagger_enabled: bool,
    #[serde(default)]
    pub stagger_seconds: Option<u64>,
    #[serde(default)]
    pub graceful_enabled: bool,
    #[serde(default, alias = "drainTimeout")]
    pub drain_timeout_ms: Option<u64>,
}

impl RotationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mode == RotationMode::Interval {
            match self.interval_seconds {
                Some(secs) if secs > 0 => {}
                _ => {
                    return Err(SnapError::InvalidConfig(
                        "intervalSeconds must be a positive number in interval mode".into(),
                    ))
                }
            }
        }
        for (field, value) in [
            ("intervalSeconds", self.interval_seconds),
            ("staggerSeconds", self.stagger_seconds),
        ] {
            if value.is_some_and(|secs| secs > MAX_PERIOD_SECONDS) {
                return Err(SnapError::InvalidConfig(format!(
                    "{} must not exceed {} seconds",
                    field, MAX_PERIOD_SECONDS
                )));
            }
        }
        Ok(())
    }

    /// Period of the interval timer, if interval mode is active
    pub fn period(&self) -> Option<Duration> {
        match self.mode {
            RotationMode::Interval => self
                .interval_seconds
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            RotationMode::Manual => None,
        }
    }

    /// Delay between instances when staggering, if enabled
    pub fn stagger(&self) -> Option<Duration> {
        if !self.stagger_enabled {
            return None;
        }
        self.stagger_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Rotation style implied by this config
    pub fn style(&self, default_drain: Duration) -> RotationStyle {
        if self.graceful_enabled {
            RotationStyle::Graceful {
                drain: self
                    .drain_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_drain),
            }
        } else {
            RotationStyle::Simple
        }
    }
}

/// Whether a rotation interrupts traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStyle {
    /// Stop, swap the address, start again
    Simple,
    /// Start the replacement first and retire the original after `drain`
    Graceful { drain: Duration },
}

impl RotationStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStyle::Simple => "simple",
            RotationStyle::Graceful { .. } => "graceful",
        }
    }
}

/// One member of a rotation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationTarget {
    pub id: i64,
    /// Address to move to; generated when absent
    #[serde(default)]
    pub new_address: Option<Ipv6Addr>,
}

impl RotationTarget {
    pub fn generated(id: i64) -> Self {
        Self {
            id,
            new_address: None,
        }
    }
}

/// Emitted after an instance has been moved to a new address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationEvent {
    pub rotation_id: Uuid,
    pub instance_id: i64,
    pub new_address: Ipv6Addr,
    pub rotated_at: DateTime<Utc>,
}

/// Outcome of a single-instance rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationOutcome {
    pub instance_id: i64,
    pub old_address: Ipv6Addr,
    pub new_address: Ipv6Addr,
    pub healthy: bool,
}

/// Per-instance result inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Ok { address: Ipv6Addr, healthy: bool },
    Failed { error: String },
}

impl InstanceOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, InstanceOutcome::Ok { .. })
    }
}

/// Per-instance results of a multi-instance operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub outcomes: BTreeMap<i64, InstanceOutcome>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(&mut self, id: i64, address: Ipv6Addr, healthy: bool) {
        self.outcomes
            .insert(id, InstanceOutcome::Ok { address, healthy });
    }

    pub fn fail(&mut self, id: i64, error: impl ToString) {
        self.outcomes.insert(
            id,
            InstanceOutcome::Failed {
                error: error.to_string(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<i64> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_ok())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn succeeded_ids(&self) -> Vec<i64> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Turn any per-instance failure into a `PartialBatchFailure`
    pub fn into_result(self) -> Result<Self> {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                InstanceOutcome::Failed { error } => Some(format!("instance {}: {}", id, error)),
                InstanceOutcome::Ok { .. } => None,
            })
            .collect();

        if failures.is_empty() {
            Ok(self)
        } else {
            Err(SnapError::PartialBatchFailure {
                failed: failures.len(),
                total: self.outcomes.len(),
                details: failures.join(", "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_mode_requires_interval() {
        let config = RotationConfig {
            mode: RotationMode::Interval,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SnapError::InvalidConfig(_))
        ));

        let config = RotationConfig {
            mode: RotationMode::Interval,
            interval_seconds: Some(60),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.period(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_periods_longer_than_a_year_are_rejected() {
        let config = RotationConfig {
            mode: RotationMode::Interval,
            interval_seconds: Some(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SnapError::InvalidConfig(_))
        ));

        let config = RotationConfig {
            stagger_enabled: true,
            stagger_seconds: Some(MAX_PERIOD_SECONDS + 1),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SnapError::InvalidConfig(_))
        ));

        let config = RotationConfig {
            mode: RotationMode::Interval,
            interval_seconds: Some(MAX_PERIOD_SECONDS),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_manual_mode_has_no_period() {
        let config = RotationConfig {
            mode: RotationMode::Manual,
            interval_seconds: Some(60),
            ..Default::default()
        };
        assert_eq!(config.period(), None);
    }

    #[test]
    fn test_stagger_requires_enabled_flag_and_delay() {
        let mut config = RotationConfig {
            stagger_seconds: Some(5),
            ..Default::default()
        };
        assert_eq!(config.stagger(), None);

        config.stagger_enabled = true;
        assert_eq!(config.stagger(), Some(Duration::from_secs(5)));

        config.stagger_seconds = None;
        assert_eq!(config.stagger(), None);
    }

    #[test]
    fn test_style_uses_default_drain() {
        let default_drain = Duration::from_secs(30);
        let mut config = RotationConfig::default();
        assert_eq!(config.style(default_drain), RotationStyle::Simple);

        config.graceful_enabled = true;
        assert_eq!(
            config.style(default_drain),
            RotationStyle::Graceful {
                drain: default_drain
            }
        );

        config.drain_timeout_ms = Some(5000);
        assert_eq!(
            config.style(default_drain),
            RotationStyle::Graceful {
                drain: Duration::from_millis(5000)
            }
        );
    }

    #[test]
    fn test_config_deserializes_legacy_drain_field() {
        let config: RotationConfig = serde_json::from_str(
            r#"{"mode":"interval","intervalSeconds":120,"staggerEnabled":false,"gracefulEnabled":true,"drainTimeout":1500}"#,
        )
        .unwrap();
        assert_eq!(config.drain_timeout_ms, Some(1500));
        assert_eq!(config.period(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_batch_report_partial_failure() {
        let mut report = BatchReport::new();
        report.succeed(1, "2001:db8::1".parse().unwrap(), true);
        report.fail(2, "spawn failed");

        assert_eq!(report.succeeded_ids(), vec![1]);
        assert_eq!(report.failed_ids(), vec![2]);

        match report.into_result() {
            Err(SnapError::PartialBatchFailure { failed, total, .. }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
    }
}

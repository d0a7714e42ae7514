//! Egress verification of proxy instances
//!
//! A check asks an address-echo service, through the instance's own endpoint,
//! which source address it sees. The instance is healthy when that address is
//! its bound address. Outcomes are data, never errors.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::registry::ProxyPoolRegistry;
use crate::config::HealthConfig;
use crate::models::{HealthState, ProxyInstance};

/// Source of the egress address observed through an instance
#[async_trait]
pub trait EgressProbe: Send + Sync {
    async fn egress_address(&self, instance: &ProxyInstance) -> anyhow::Result<IpAddr>;
}

/// Probe that sends an HTTP(S) request through the instance to an echo service
pub struct HttpEchoProbe {
    echo_url: String,
    timeout: Duration,
}

impl HttpEchoProbe {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            echo_url: config.echo_url.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl EgressProbe for HttpEchoProbe {
    async fn egress_address(&self, instance: &ProxyInstance) -> anyhow::Result<IpAddr> {
        let proxy = reqwest::Proxy::all(instance.proxy_uri())?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()?;

        let body = client
            .get(&self.echo_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(body.trim().parse::<IpAddr>()?)
    }
}

/// Runs egress checks and records the resulting health state
pub struct HealthChecker {
    registry: Arc<ProxyPoolRegistry>,
    probe: Arc<dyn EgressProbe>,
    attempts: u32,
    initial_delay: Duration,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ProxyPoolRegistry>,
        probe: Arc<dyn EgressProbe>,
        attempts: u32,
        initial_delay: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            attempts: attempts.max(1),
            initial_delay,
        }
    }

    /// One check. Unknown instances are reported unhealthy.
    #[instrument(skip(self))]
    pub async fn check(&self, id: i64) -> bool {
        let Ok(slot) = self.registry.get(id) else {
            return false;
        };

        let instance = slot.update(|instance| {
            instance.health_state = HealthState::Checking;
            instance.clone()
        });

        let healthy = match self.probe.egress_address(&instance).await {
            Ok(IpAddr::V6(seen)) if seen == instance.bound_address => true,
            Ok(seen) => {
                debug!(expected = %instance.bound_address, seen = %seen, "Egress address mismatch");
                false
            }
            Err(e) => {
                debug!(error = %e, "Egress probe failed");
                false
            }
        };

        // A rotation may have rebound the instance meanwhile; keep its state then
        slot.update(|current| {
            if current.bound_address == instance.bound_address {
                current.health_state = if healthy {
                    HealthState::Healthy
                } else {
                    HealthState::Unhealthy
                };
            }
        });

        healthy
    }

    /// Retry with linear backoff: the n-th retry waits `initial_delay * n`
    #[instrument(skip(self))]
    pub async fn check_with_retry(&self, id: i64, max_attempts: u32, initial_delay: Duration) -> bool {
        let max_attempts = max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self.check(id).await {
                if attempt > 1 {
                    info!(attempt, "Health check passed after retry");
                }
                return true;
            }

            if attempt < max_attempts {
                let delay = initial_delay * attempt;
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Health check failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        if let Ok(slot) = self.registry.get(id) {
            slot.update(|instance| instance.health_state = HealthState::Unhealthy);
        }
        warn!(attempts = max_attempts, "Health check failed after all attempts");
        false
    }

    /// Retry with the configured attempt count and delay
    pub async fn verify(&self, id: i64) -> bool {
        self.check_with_retry(id, self.attempts, self.initial_delay).await
    }

    /// Verify several instances concurrently; one failure never aborts the others
    pub async fn verify_many(&self, ids: &[i64]) -> Vec<(i64, bool)> {
        let results = join_all(ids.iter().map(|&id| self.verify(id))).await;
        ids.iter().copied().zip(results).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceSpec, ProxyKind};
    use crate::pool::testing::{FakeProbe, ProbeMode};
    use tokio::time::Instant;

    fn registry_with(id: i64) -> Arc<ProxyPoolRegistry> {
        let registry = Arc::new(ProxyPoolRegistry::new());
        registry
            .insert(ProxyInstance::from_spec(
                &InstanceSpec {
                    id,
                    kind: ProxyKind::Http,
                    listen_port: 10000 + id as u16,
                    bound_address: format!("2001:db8::{}", id).parse().unwrap(),
                    interface_name: "eth0".into(),
                    prefix_length: 64,
                    credentials: None,
                },
                None,
            ))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_check_healthy_when_egress_matches() {
        let registry = registry_with(1);
        let probe = Arc::new(FakeProbe::new(ProbeMode::Echo));
        let checker = HealthChecker::new(registry.clone(), probe, 3, Duration::from_millis(10));

        assert!(checker.check(1).await);
        assert_eq!(registry.snapshot(1).unwrap().health_state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_check_unhealthy_on_mismatch_or_error() {
        let registry = registry_with(1);
        let probe = Arc::new(FakeProbe::new(ProbeMode::Fixed(
            "2001:db8::ffff".parse().unwrap(),
        )));
        let checker = HealthChecker::new(registry.clone(), probe.clone(), 3, Duration::from_millis(10));

        assert!(!checker.check(1).await);
        assert_eq!(registry.snapshot(1).unwrap().health_state, HealthState::Unhealthy);

        probe.set_mode(ProbeMode::Fail);
        assert!(!checker.check(1).await);
        assert!(!checker.check(99).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_uses_linear_backoff() {
        let registry = registry_with(1);
        let probe = Arc::new(FakeProbe::new(ProbeMode::Fail));
        let checker = HealthChecker::new(registry.clone(), probe.clone(), 3, Duration::from_secs(1));

        let start = Instant::now();
        let healthy = checker.check_with_retry(1, 3, Duration::from_millis(1000)).await;

        assert!(!healthy);
        let calls = probe.call_times();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0] - start, Duration::ZERO);
        assert_eq!(calls[1] - calls[0], Duration::from_millis(1000));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(2000));
        assert_eq!(registry.snapshot(1).unwrap().health_state, HealthState::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_first_success() {
        let registry = registry_with(1);
        let probe = Arc::new(FakeProbe::new(ProbeMode::FailTimes(1)));
        let checker = HealthChecker::new(registry.clone(), probe.clone(), 3, Duration::from_secs(1));

        assert!(checker.check_with_retry(1, 5, Duration::from_millis(500)).await);
        assert_eq!(probe.call_times().len(), 2);
        assert_eq!(registry.snapshot(1).unwrap().health_state, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_many_reports_each_instance() {
        let registry = registry_with(1);
        registry
            .insert(ProxyInstance::from_spec(
                &InstanceSpec {
                    id: 2,
                    kind: ProxyKind::Socks5,
                    listen_port: 10002,
                    bound_address: "2001:db8::2".parse().unwrap(),
                    interface_name: "eth0".into(),
                    prefix_length: 64,
                    credentials: None,
                },
                None,
            ))
            .unwrap();

        let probe = Arc::new(FakeProbe::new(ProbeMode::Echo));
        probe.fail_port(10002);
        let checker = HealthChecker::new(registry, probe, 2, Duration::from_millis(100));

        let results = checker.verify_many(&[1, 2]).await;
        assert_eq!(results, vec![(1, true), (2, false)]);
    }
}

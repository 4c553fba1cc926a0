use crate::PollError;
use device_registry::{DeviceRegistry, MetricStore};
use knx_transport::{GroupAddress, GroupBus, GroupEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to do when a read request cannot be sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop polling and return the error.
    #[default]
    Abort,
    /// Log the failure and poll the remaining devices.
    Continue,
}

#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub policy: FailurePolicy,
    /// Extra attempts per device before the policy applies.
    pub retries: u32,
    /// Delay before the first retry; doubled for each further one.
    pub backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::Abort,
            retries: 0,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    pub sent: usize,
    pub failed: Vec<GroupAddress>,
}

/// Issues one group read per registered device so values arrive before the
/// first scrape.
pub struct StartupPoller {
    registry: Arc<DeviceRegistry>,
    store: Arc<MetricStore>,
    config: PollerConfig,
}

impl StartupPoller {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<MetricStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub async fn run<B: GroupBus + ?Sized>(&self, bus: &B) -> Result<PollReport, PollError> {
        let mut report = PollReport::default();
        for device in self.registry.iter() {
            let desc = device.descriptor();
            let request = GroupEvent::read(desc.address);
            let mut attempt = 0u32;
            loop {
                match bus.send(&request).await {
                    Ok(()) => {
                        self.store.bridge().read_requests_sent.inc();
                        debug!(device = %desc.name, address = %desc.address, "read request sent");
                        report.sent += 1;
                        break;
                    }
                    Err(e) if attempt < self.config.retries => {
                        let delay = self.config.backoff.saturating_mul(1 << attempt.min(16));
                        warn!(
                            device = %desc.name,
                            address = %desc.address,
                            error = %e,
                            retry_in = ?delay,
                            "read request failed, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => match self.config.policy {
                        FailurePolicy::Abort => {
                            return Err(PollError::Send {
                                name: desc.name.clone(),
                                address: desc.address,
                                source: e,
                            })
                        }
                        FailurePolicy::Continue => {
                            warn!(
                                device = %desc.name,
                                address = %desc.address,
                                error = %e,
                                "read request failed, skipping device"
                            );
                            report.failed.push(desc.address);
                            break;
                        }
                    },
                }
            }
        }
        info!(
            sent = report.sent,
            failed = report.failed.len(),
            "startup poll finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_registry::{DatapointType, DecoderTable, DeviceDescriptor};
    use knx_transport::{GroupCommand, MockBus};
    use std::collections::HashSet;

    fn ga(main: u8, middle: u8, sub: u8) -> GroupAddress {
        GroupAddress::new(main, middle, sub).unwrap()
    }

    fn poller(config: PollerConfig) -> (StartupPoller, Arc<MetricStore>) {
        let descs = vec![
            DeviceDescriptor::new("c", ga(4, 0, 0), DatapointType::TEMPERATURE),
            DeviceDescriptor::new("a", ga(1, 0, 1), DatapointType::TEMPERATURE),
            DeviceDescriptor::new("b", ga(1, 0, 2), DatapointType::SWITCH),
        ];
        let registry = Arc::new(DeviceRegistry::build(descs, &DecoderTable::builtin()).unwrap());
        let store = Arc::new(MetricStore::new().unwrap());
        (StartupPoller::new(registry, store.clone(), config), store)
    }

    #[tokio::test]
    async fn one_read_per_device() {
        let (poller, store) = poller(PollerConfig::default());
        let (bus, feed) = MockBus::new(1);
        let report = poller.run(&bus).await.unwrap();
        assert_eq!(report.sent, 3);
        let sent = feed.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|e| e.command == GroupCommand::Read && e.data.is_empty()));
        let targets: HashSet<_> = sent.iter().map(|e| e.destination).collect();
        let expected: HashSet<_> = [ga(4, 0, 0), ga(1, 0, 1), ga(1, 0, 2)].into_iter().collect();
        assert_eq!(targets, expected);
        assert_eq!(store.bridge().read_requests_sent.get(), 3);
    }

    #[tokio::test]
    async fn abort_policy_stops_at_first_failure() {
        let (poller, _) = poller(PollerConfig::default());
        let (bus, feed) = MockBus::new(1);
        feed.fail_sends_to(ga(1, 0, 1));
        let err = poller.run(&bus).await.unwrap_err();
        match err {
            PollError::Send { name, address, .. } => {
                assert_eq!(name, "a");
                assert_eq!(address, ga(1, 0, 1));
            }
        }
        assert_eq!(feed.sent().len(), 1);
    }

    #[tokio::test]
    async fn continue_policy_skips_failed_devices() {
        let (poller, _) = poller(PollerConfig {
            policy: FailurePolicy::Continue,
            retries: 2,
            backoff: Duration::from_millis(1),
        });
        let (bus, feed) = MockBus::new(1);
        feed.fail_sends_to(ga(4, 0, 0));
        let report = poller.run(&bus).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, vec![ga(4, 0, 0)]);
        assert_eq!(feed.sent().len(), 2);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_sent() {
        let (poller, store) = poller(PollerConfig {
            policy: FailurePolicy::Abort,
            retries: 3,
            backoff: Duration::from_millis(1),
        });
        let (bus, feed) = MockBus::new(1);
        feed.fail_next_sends_to(ga(1, 0, 2), 2);
        let report = poller.run(&bus).await.unwrap();
        assert_eq!(report.sent, 3);
        assert!(report.failed.is_empty());
        assert_eq!(feed.attempts(ga(1, 0, 2)), 3);
        assert_eq!(feed.attempts(ga(4, 0, 0)), 1);
        assert_eq!(store.bridge().read_requests_sent.get(), 3);
    }

    #[tokio::test]
    async fn retries_back_off_then_give_up() {
        let (poller, _) = poller(PollerConfig {
            policy: FailurePolicy::Abort,
            retries: 2,
            backoff: Duration::from_millis(20),
        });
        let (bus, feed) = MockBus::new(1);
        feed.fail_sends_to(ga(4, 0, 0));
        let started = std::time::Instant::now();
        assert!(poller.run(&bus).await.is_err());
        // 20 ms then 40 ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(feed.attempts(ga(4, 0, 0)), 3);
        assert!(feed.sent().is_empty());
    }
}

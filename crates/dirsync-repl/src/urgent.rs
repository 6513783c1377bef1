//! Urgent replication coordinator.
//!
//! A writer that needs its change observably propagated asks the coordinator
//! and waits for a reply. The coordinator task owns all wave state: it
//! notifies every live partner in parallel, counts acknowledgements against a
//! configurable threshold, and releases the writers that were waiting when the
//! wave started. Requests arriving mid-wave are coalesced into the next wave.

use crate::agreement::AgreementRegistry;
use crate::metrics::MetricsRegistry;
use crate::partner::UrgentNotifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;

/// Configuration for the urgent coordinator.
#[derive(Debug, Clone)]
pub struct UrgentConfig {
    /// Acknowledgements needed per wave; `None` means every live partner.
    pub ack_threshold: Option<usize>,
    /// Maximum time one wave waits for acknowledgements.
    pub wave_timeout: Duration,
    /// Writer wait used when the caller passes no timeout.
    pub default_writer_timeout: Duration,
    /// Pause before re-running a wave that fell short.
    pub retry_backoff: Duration,
    /// Request channel capacity.
    pub channel_capacity: usize,
}

impl Default for UrgentConfig {
    fn default() -> Self {
        Self {
            ack_threshold: None,
            wave_timeout: Duration::from_secs(10),
            default_writer_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(100),
            channel_capacity: 256,
        }
    }
}

impl UrgentConfig {
    /// Acknowledgements required when `partners` are live.
    pub fn required_acks(&self, partners: usize) -> usize {
        self.ack_threshold.unwrap_or(partners).min(partners)
    }
}

/// How a wave ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveVerdict {
    /// Enough partners acknowledged.
    Acknowledged,
    /// No live partner to wait for.
    NoPartners,
    /// Every notification failed.
    DispatchFailed,
    /// Every partner answered but too few acknowledged.
    Insufficient,
    /// The per-wave timeout elapsed short of the threshold.
    TimedOut,
}

impl WaveVerdict {
    /// Whether writers of the wave are released.
    pub fn releases_writers(self) -> bool {
        matches!(
            self,
            WaveVerdict::Acknowledged | WaveVerdict::NoPartners | WaveVerdict::DispatchFailed
        )
    }
}

/// Result of one wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveSummary {
    /// Wave sequence number, starting at 1.
    pub wave: u64,
    /// Live partners notified.
    pub partners: usize,
    /// Acknowledgements required.
    pub required: usize,
    /// Partners that acknowledged.
    pub acknowledged: usize,
    /// Partners whose notification failed.
    pub failed: usize,
    /// Verdict.
    pub verdict: WaveVerdict,
}

/// What a waiting writer observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrgentOutcome {
    /// A wave released the writer.
    Done(WaveSummary),
    /// The writer's own deadline passed first.
    TimedOut,
    /// The coordinator shut down.
    Shutdown,
}

enum Command {
    Wait(oneshot::Sender<UrgentOutcome>),
    Shutdown,
}

type Waiter = oneshot::Sender<UrgentOutcome>;

/// Writer-side handle of the coordinator.
#[derive(Clone)]
pub struct UrgentHandle {
    tx: mpsc::Sender<Command>,
    default_timeout: Duration,
}

impl UrgentHandle {
    /// Block until enough partners acknowledged, the timeout elapsed, or the
    /// coordinator shut down. The local write is never undone either way.
    pub async fn wait_for_propagation(&self, timeout: Option<Duration>) -> UrgentOutcome {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        let deadline = tokio::time::Instant::now() + timeout;
        let sent = match self.tx.try_send(Command::Wait(reply_tx)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                matches!(tokio::time::timeout_at(deadline, self.tx.send(cmd)).await, Ok(Ok(())))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return UrgentOutcome::Shutdown,
        };
        if !sent {
            return if self.tx.is_closed() {
                UrgentOutcome::Shutdown
            } else {
                UrgentOutcome::TimedOut
            };
        }
        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => UrgentOutcome::Shutdown,
            Err(_) => UrgentOutcome::TimedOut,
        }
    }

    /// Stop the coordinator; every waiting writer is released.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    /// Whether the coordinator task is still running.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Coordinator task state.
pub struct UrgentCoordinator {
    config: UrgentConfig,
    agreements: Arc<AgreementRegistry>,
    notifier: Arc<dyn UrgentNotifier>,
    metrics: Arc<Mutex<MetricsRegistry>>,
    waves: u64,
    shutting_down: bool,
}

impl UrgentCoordinator {
    /// Spawn the coordinator and return the writer handle.
    pub fn start(
        config: UrgentConfig,
        agreements: Arc<AgreementRegistry>,
        notifier: Arc<dyn UrgentNotifier>,
        metrics: Arc<Mutex<MetricsRegistry>>,
    ) -> UrgentHandle {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let handle = UrgentHandle {
            tx,
            default_timeout: config.default_writer_timeout,
        };
        let coordinator = UrgentCoordinator {
            config,
            agreements,
            notifier,
            metrics,
            waves: 0,
            shutting_down: false,
        };
        tokio::spawn(coordinator.run(rx));
        handle
    }

    fn accept(&mut self, cmd: Option<Command>, pending: &mut Vec<Waiter>) {
        match cmd {
            Some(Command::Wait(reply)) => pending.push(reply),
            Some(Command::Shutdown) | None => self.shutting_down = true,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut pending: Vec<Waiter> = Vec::new();
        while !self.shutting_down {
            if pending.is_empty() {
                let cmd = rx.recv().await;
                self.accept(cmd, &mut pending);
            }
            while let Ok(cmd) = rx.try_recv() {
                self.accept(Some(cmd), &mut pending);
            }
            pending.retain(|w| !w.is_closed());
            if self.shutting_down || pending.is_empty() {
                continue;
            }

            let writers = std::mem::take(&mut pending);
            let summary = self.run_wave(&mut rx, &mut pending).await;
            if summary.verdict.releases_writers() {
                self.metrics.lock().await.urgent.writers_released += writers.len() as u64;
                for writer in writers {
                    let _ = writer.send(UrgentOutcome::Done(summary.clone()));
                }
            } else if self.shutting_down {
                for writer in writers {
                    let _ = writer.send(UrgentOutcome::Shutdown);
                }
            } else {
                tracing::debug!(wave = summary.wave, carried = writers.len(), "wave fell short, carrying writers");
                pending.extend(writers);
                self.backoff(&mut rx, &mut pending).await;
            }
        }

        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            if let Command::Wait(reply) = cmd {
                pending.push(reply);
            }
        }
        let released = pending.len();
        for writer in pending {
            let _ = writer.send(UrgentOutcome::Shutdown);
        }
        tracing::info!(released, waves = self.waves, "urgent coordinator stopped");
    }

    async fn backoff(&mut self, rx: &mut mpsc::Receiver<Command>, pending: &mut Vec<Waiter>) {
        let pause = tokio::time::sleep(self.config.retry_backoff);
        tokio::pin!(pause);
        while !self.shutting_down {
            tokio::select! {
                _ = &mut pause => return,
                cmd = rx.recv() => self.accept(cmd, pending),
            }
        }
    }

    /// Notify every live partner and count acknowledgements. Requests that
    /// arrive meanwhile land in `pending` for the next wave.
    async fn run_wave(&mut self, rx: &mut mpsc::Receiver<Command>, pending: &mut Vec<Waiter>) -> WaveSummary {
        self.waves += 1;
        let partners = self.agreements.live_snapshot().await;
        let mut summary = WaveSummary {
            wave: self.waves,
            partners: partners.len(),
            required: self.config.required_acks(partners.len()),
            acknowledged: 0,
            failed: 0,
            verdict: WaveVerdict::NoPartners,
        };
        self.metrics.lock().await.urgent.waves_started += 1;
        if partners.is_empty() {
            return summary;
        }

        let mut calls = JoinSet::new();
        for agreement in partners {
            let notifier = self.notifier.clone();
            calls.spawn(async move {
                let result = notifier.notify(&agreement).await;
                (agreement.id, result)
            });
        }

        let deadline = tokio::time::sleep(self.config.wave_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        while summary.acknowledged < summary.required
            && summary.acknowledged + summary.failed < summary.partners
            && !self.shutting_down
        {
            tokio::select! {
                joined = calls.join_next() => match joined {
                    Some(Ok((_, Ok(())))) => summary.acknowledged += 1,
                    Some(Ok((agreement, Err(e)))) => {
                        tracing::debug!(wave = summary.wave, agreement = %agreement, error = %e, "partner did not acknowledge");
                        summary.failed += 1;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(wave = summary.wave, error = %e, "notification task failed");
                        summary.failed += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                cmd = rx.recv() => self.accept(cmd, pending),
            }
        }
        calls.detach_all();

        summary.verdict = if summary.acknowledged >= summary.required {
            WaveVerdict::Acknowledged
        } else if summary.failed == summary.partners {
            WaveVerdict::DispatchFailed
        } else if timed_out || self.shutting_down {
            WaveVerdict::TimedOut
        } else {
            WaveVerdict::Insufficient
        };

        let mut metrics = self.metrics.lock().await;
        match summary.verdict {
            WaveVerdict::Acknowledged => metrics.urgent.waves_acknowledged += 1,
            WaveVerdict::TimedOut => metrics.urgent.waves_timed_out += 1,
            _ => {}
        }
        tracing::debug!(
            wave = summary.wave,
            partners = summary.partners,
            acknowledged = summary.acknowledged,
            verdict = ?summary.verdict,
            "urgent wave finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::ReplicationAgreement;
    use crate::error::{ReplError, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Acknowledges after a per-partner delay; partners without a delay fail.
    struct FakeNotifier {
        delays: HashMap<String, Duration>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UrgentNotifier for FakeNotifier {
        async fn notify(&self, agreement: &ReplicationAgreement) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.delays.get(&agreement.id) {
                Some(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(())
                }
                None => Err(ReplError::NetworkError {
                    msg: "unreachable".to_string(),
                }),
            }
        }
    }

    async fn setup(
        partners: &[(&str, Option<u64>)],
        config: UrgentConfig,
    ) -> (UrgentHandle, Arc<FakeNotifier>, Arc<Mutex<MetricsRegistry>>) {
        let registry = Arc::new(AgreementRegistry::new());
        let mut delays = HashMap::new();
        for (id, delay) in partners {
            registry.add(ReplicationAgreement::new(*id, format!("ldap://{}", id))).await;
            if let Some(ms) = delay {
                delays.insert(id.to_string(), Duration::from_millis(*ms));
            }
        }
        let notifier = Arc::new(FakeNotifier {
            delays,
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(Mutex::new(MetricsRegistry::new()));
        let handle = UrgentCoordinator::start(config, registry, notifier.clone(), metrics.clone());
        (handle, notifier, metrics)
    }

    fn done(outcome: UrgentOutcome) -> WaveSummary {
        match outcome {
            UrgentOutcome::Done(summary) => summary,
            other => panic!("expected a released writer, got {:?}", other),
        }
    }

    #[test]
    fn test_required_acks() {
        let config = UrgentConfig::default();
        assert_eq!(config.required_acks(3), 3);
        let config = UrgentConfig {
            ack_threshold: Some(2),
            ..UrgentConfig::default()
        };
        assert_eq!(config.required_acks(3), 2);
        assert_eq!(config.required_acks(1), 1);
        assert_eq!(config.required_acks(0), 0);
    }

    mod waves {
        use super::*;

        #[tokio::test]
        async fn test_no_partners_releases_immediately() {
            let (handle, _, _) = setup(&[], UrgentConfig::default()).await;
            let summary = done(handle.wait_for_propagation(Some(Duration::from_secs(1))).await);
            assert_eq!(summary.verdict, WaveVerdict::NoPartners);
        }

        #[tokio::test]
        async fn test_all_partners_acknowledge() {
            let (handle, notifier, metrics) =
                setup(&[("a", Some(10)), ("b", Some(20))], UrgentConfig::default()).await;
            let summary = done(handle.wait_for_propagation(None).await);
            assert_eq!(summary.verdict, WaveVerdict::Acknowledged);
            assert_eq!(summary.acknowledged, 2);
            assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
            let metrics = metrics.lock().await;
            assert_eq!(metrics.urgent.waves_acknowledged, 1);
            assert_eq!(metrics.urgent.writers_released, 1);
        }

        #[tokio::test]
        async fn test_threshold_releases_before_slow_partner() {
            let config = UrgentConfig {
                ack_threshold: Some(1),
                ..UrgentConfig::default()
            };
            let (handle, _, _) = setup(&[("fast", Some(5)), ("slow", Some(60_000))], config).await;
            let summary = done(handle.wait_for_propagation(Some(Duration::from_secs(5))).await);
            assert_eq!(summary.verdict, WaveVerdict::Acknowledged);
            assert_eq!(summary.required, 1);
        }

        #[tokio::test]
        async fn test_unreachable_partners_release_writers() {
            let (handle, _, _) = setup(&[("a", None), ("b", None)], UrgentConfig::default()).await;
            let summary = done(handle.wait_for_propagation(Some(Duration::from_secs(5))).await);
            assert_eq!(summary.verdict, WaveVerdict::DispatchFailed);
            assert_eq!(summary.failed, 2);
        }

        #[tokio::test]
        async fn test_writer_deadline_bounds_wait() {
            let config = UrgentConfig {
                wave_timeout: Duration::from_millis(30),
                ..UrgentConfig::default()
            };
            let (handle, _, metrics) = setup(&[("slow", Some(60_000))], config).await;
            let outcome = handle.wait_for_propagation(Some(Duration::from_millis(200))).await;
            assert_eq!(outcome, UrgentOutcome::TimedOut);
            assert!(metrics.lock().await.urgent.waves_timed_out >= 1);
        }
    }

    mod coalescing {
        use super::*;

        #[tokio::test]
        async fn test_mid_wave_writers_share_next_wave() {
            let (handle, notifier, _) = setup(&[("a", Some(100))], UrgentConfig::default()).await;
            let first = {
                let handle = handle.clone();
                tokio::spawn(async move { handle.wait_for_propagation(None).await })
            };
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut later = Vec::new();
            for _ in 0..3 {
                let handle = handle.clone();
                later.push(tokio::spawn(async move { handle.wait_for_propagation(None).await }));
            }

            assert_eq!(done(first.await.unwrap()).wave, 1);
            for writer in later {
                assert_eq!(done(writer.await.unwrap()).wave, 2);
            }
            assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test]
        async fn test_shutdown_releases_waiting_writers() {
            let (handle, _, _) = setup(&[("slow", Some(60_000))], UrgentConfig::default()).await;
            let writer = {
                let handle = handle.clone();
                tokio::spawn(async move { handle.wait_for_propagation(Some(Duration::from_secs(30))).await })
            };
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.shutdown().await;
            assert_eq!(writer.await.unwrap(), UrgentOutcome::Shutdown);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!handle.is_running());
            assert_eq!(handle.wait_for_propagation(None).await, UrgentOutcome::Shutdown);
        }

        #[tokio::test]
        async fn test_interrupted_wave_is_not_reported_done() {
            let (handle, _, metrics) = setup(&[("a", None), ("slow", Some(60_000))], UrgentConfig::default()).await;
            let writers: Vec<_> = (0..2)
                .map(|_| {
                    let handle = handle.clone();
                    tokio::spawn(async move { handle.wait_for_propagation(None).await })
                })
                .collect();
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.shutdown().await;
            for writer in writers {
                assert_eq!(writer.await.unwrap(), UrgentOutcome::Shutdown);
            }
            assert_eq!(metrics.lock().await.urgent.writers_released, 0);
        }
    }
}

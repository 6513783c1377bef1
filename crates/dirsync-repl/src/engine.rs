//! The replication cycle engine: pulls changes from every partner.
//!
//! One cycle walks the live agreements in order. For each one it binds to the
//! partner, pages through every change past the agreement watermark, hands
//! each entry to the [`EntryMutator`], drains a FIFO retry queue for entries
//! that failed recoverably, and finally commits the watermark and the
//! up-to-date vector. Any application failure in a cycle sets the
//! replica-wide recovery flag, which suppresses every commit for the rest of
//! that cycle; the next cycle re-fetches from the old watermark.

use crate::agreement::{AgreementId, AgreementRegistry, ReplicationAgreement};
use crate::backend::{Backend, TxnGuard};
use crate::error::{ReplError, Result};
use crate::metrics::MetricsRegistry;
use crate::mutator::{originating_writes, ApplyOutcome, EntryMutator};
use crate::partner::{Credentials, PageEntry, PartnerConnector, PartnerSession, SearchRequest};
use crate::uptodate::{Cookie, UpToDateStore, UpToDateVector};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

/// Log line for changes that can neither be applied nor resolved.
const UNRESOLVED_MSG: &str = "possible conflict, no resolution, convergence not guaranteed for this subtree";

/// Configuration for the replication engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Naming-context root DN; the up-to-date vector is persisted there.
    pub base_dn: String,
    /// Container holding agreement entries, reloaded at every cycle start.
    pub agreement_container: Option<String>,
    /// Entries requested per page.
    pub page_size: usize,
    /// Sleep between cycles.
    pub cycle_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dn: "dc=example,dc=com".to_string(),
            agreement_container: None,
            page_size: 100,
            cycle_interval: Duration::from_secs(60),
        }
    }
}

/// Where the engine is inside a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CycleState {
    /// Between cycles.
    #[default]
    Idle,
    /// Binding to a partner.
    Connecting,
    /// Fetching and applying pages.
    Paging,
    /// Draining the retry queue.
    Retrying,
    /// Persisting watermark and vector.
    CommittingCookie,
    /// Run loop exited.
    Stopped,
}

/// What one agreement's pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgreementReport {
    /// Agreement processed.
    pub agreement: AgreementId,
    /// Partner could not be bound; nothing was fetched.
    pub skipped: bool,
    /// Pages received.
    pub pages: u64,
    /// Entries applied on first attempt (written or resolved to local state).
    pub applied: u64,
    /// Entries applied from the retry queue.
    pub retried: u64,
    /// Entries skipped because the local vector already covered them.
    pub known: u64,
    /// Entries dropped when the retry queue stopped shrinking.
    pub dropped: u64,
    /// Entries skipped as unresolved conflicts.
    pub unresolved: u64,
    /// Error that aborted the pass, by code.
    pub fatal: Option<String>,
    /// Watermark and vector were committed.
    pub committed: bool,
    /// Agreement watermark after the pass.
    pub watermark: u64,
}

/// Result of one full cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Cycle sequence number, starting at 1.
    pub cycle: u64,
    /// Per-agreement results in processing order.
    pub agreements: Vec<AgreementReport>,
    /// Recovery flag at the end of the cycle.
    pub recovery: bool,
}

/// Published engine status.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    /// Cycles finished so far.
    pub cycles_run: u64,
    /// Current state.
    pub state: CycleState,
    /// Agreement being processed.
    pub current_agreement: Option<AgreementId>,
    /// Report of the last finished cycle.
    pub last_report: Option<CycleReport>,
}

#[derive(Debug, Default)]
struct PassTally {
    report: AgreementReport,
    outcomes: Vec<ApplyOutcome>,
}

/// The pull replication engine of one replica.
pub struct ReplicationEngine {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    mutator: EntryMutator,
    utdv: Arc<UpToDateStore>,
    agreements: Arc<AgreementRegistry>,
    connector: Arc<dyn PartnerConnector>,
    credentials: Arc<RwLock<Credentials>>,
    metrics: Arc<Mutex<MetricsRegistry>>,
    recovery: Arc<AtomicBool>,
    status_tx: watch::Sender<EngineStatus>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    cycles: u64,
}

impl ReplicationEngine {
    /// Create an engine. Nothing runs until [`ReplicationEngine::start`] or
    /// [`ReplicationEngine::run_cycle`] is called.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn Backend>,
        mutator: EntryMutator,
        utdv: Arc<UpToDateStore>,
        agreements: Arc<AgreementRegistry>,
        connector: Arc<dyn PartnerConnector>,
        credentials: Credentials,
    ) -> Self {
        let (status_tx, _) = watch::channel(EngineStatus::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            backend,
            mutator,
            utdv,
            agreements,
            connector,
            credentials: Arc::new(RwLock::new(credentials)),
            metrics: Arc::new(Mutex::new(MetricsRegistry::new())),
            recovery: Arc::new(AtomicBool::new(false)),
            status_tx,
            shutdown_rx,
            shutdown_tx,
            cycles: 0,
        }
    }

    /// Shared metrics registry.
    pub fn metrics(&self) -> Arc<Mutex<MetricsRegistry>> {
        self.metrics.clone()
    }

    /// Shared credential store; rotate through it.
    pub fn credentials(&self) -> Arc<RwLock<Credentials>> {
        self.credentials.clone()
    }

    /// Whether the current (or last) cycle hit an application failure.
    pub fn is_recovering(&self) -> bool {
        self.recovery.load(Ordering::SeqCst)
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn set_state(&self, state: CycleState, agreement: Option<&str>) {
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.current_agreement = agreement.map(str::to_string);
        });
    }

    /// Run one full cycle over every live agreement.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.recovery.store(false, Ordering::SeqCst);
        self.cycles += 1;
        self.refresh_agreements().await;

        let mut report = CycleReport {
            cycle: self.cycles,
            ..CycleReport::default()
        };
        for agreement in self.agreements.live_snapshot().await {
            if self.shutting_down() {
                tracing::info!("shutdown requested, ending cycle early");
                break;
            }
            let pass = self.replicate_agreement(&agreement).await;
            report.agreements.push(pass);
        }
        report.recovery = self.is_recovering();

        tracing::info!(
            cycle = report.cycle,
            agreements = report.agreements.len(),
            recovery = report.recovery,
            "replication cycle finished"
        );
        let published = report.clone();
        self.status_tx.send_modify(|status| {
            status.cycles_run += 1;
            status.state = CycleState::Idle;
            status.current_agreement = None;
            status.last_report = Some(published);
        });
        report
    }

    async fn refresh_agreements(&self) {
        let Some(container) = &self.config.agreement_container else {
            return;
        };
        if let Err(e) = self
            .agreements
            .load_from_directory(self.backend.as_ref(), container)
            .await
        {
            tracing::warn!(container = %container, error = %e, "failed to reload agreements");
        }
        let purged = self.agreements.purge_deleted().await;
        if !purged.is_empty() {
            let mut metrics = self.metrics.lock().await;
            for id in &purged {
                metrics.remove(id);
            }
        }
    }

    async fn connect(&self, agreement: &ReplicationAgreement) -> Result<Box<dyn PartnerSession>> {
        let creds = self.credentials.read().await.clone();
        let first = self.connector.connect(agreement, &creds.current).await;
        let err = match first {
            Ok(session) => {
                self.agreements.clear_auth_failures(&agreement.id).await;
                return Ok(session);
            }
            Err(e) => e,
        };
        if !matches!(err, ReplError::AuthFailed { .. }) {
            return Err(err);
        }
        let failures = self.agreements.record_auth_failure(&agreement.id, SystemTime::now()).await;
        self.metrics.lock().await.agreement_mut(&agreement.id).auth_failures += 1;
        let Some(previous) = creds.previous.as_ref() else {
            return Err(err);
        };
        tracing::warn!(agreement = %agreement.id, failures, "bind failed, retrying with previous credential");
        match self.connector.connect(agreement, previous).await {
            Ok(session) => {
                tracing::info!(agreement = %agreement.id, "bound with previous credential");
                Ok(session)
            }
            Err(e) => {
                if matches!(e, ReplError::AuthFailed { .. }) {
                    self.agreements.record_auth_failure(&agreement.id, SystemTime::now()).await;
                    self.metrics.lock().await.agreement_mut(&agreement.id).auth_failures += 1;
                }
                Err(e)
            }
        }
    }

    /// Vector sent with every pull, the local slot set to the highest local USN.
    async fn request_vector(&self) -> UpToDateVector {
        let highest = TxnGuard::begin(self.backend.as_ref()).and_then(|txn| txn.highest_usn());
        match highest {
            Ok(usn) => self.utdv.with_local_slot(usn).await,
            Err(e) => {
                tracing::debug!(error = %e, "local usn unavailable, pulling without own slot");
                self.utdv.snapshot().await
            }
        }
    }

    /// Whether every originating write carried by a page item is already known
    /// here. Undecodable items are left to the mutator to report.
    async fn already_known(&self, item: &PageEntry) -> bool {
        let Ok(writes) = item.decode().and_then(|change| originating_writes(&change.entry)) else {
            return false;
        };
        if writes.is_empty() {
            return false;
        }
        for (origin, usn) in &writes {
            if self.utdv.needs(origin, *usn).await {
                return false;
            }
        }
        true
    }

    fn apply_item(&self, item: &PageEntry) -> Result<ApplyOutcome> {
        let change = item.decode()?;
        self.mutator.apply(self.backend.as_ref(), &change)
    }

    fn flag_recovery(&self, agreement: &str) {
        if !self.recovery.swap(true, Ordering::SeqCst) {
            tracing::warn!(agreement, "application failure, watermark frozen for this cycle");
        }
    }

    async fn replicate_agreement(&self, agreement: &ReplicationAgreement) -> AgreementReport {
        let mut tally = PassTally {
            report: AgreementReport {
                agreement: agreement.id.clone(),
                watermark: agreement.last_usn,
                ..AgreementReport::default()
            },
            outcomes: Vec::new(),
        };

        self.set_state(CycleState::Connecting, Some(&agreement.id));
        let mut session = match self.connect(agreement).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(agreement = %agreement.id, error = %e, "partner unavailable, skipping for this cycle");
                tally.report.skipped = true;
                self.metrics.lock().await.agreement_mut(&agreement.id).cycles_skipped += 1;
                return tally.report;
            }
        };

        let sync_done = self.pull_pages(agreement, session.as_mut(), &mut tally).await;

        self.set_state(CycleState::CommittingCookie, Some(&agreement.id));
        if let Some(cookie) = sync_done {
            if !self.is_recovering() && tally.report.fatal.is_none() {
                match self.commit(agreement, &cookie).await {
                    Ok(()) => {
                        tally.report.committed = true;
                        tally.report.watermark = cookie.partner_usn;
                    }
                    Err(e) => {
                        tracing::error!(agreement = %agreement.id, error = %e, "failed to commit watermark");
                        self.flag_recovery(&agreement.id);
                        tally.report.fatal = Some(e.code().to_string());
                    }
                }
            }
        }
        if !tally.report.committed {
            tracing::info!(
                agreement = %agreement.id,
                watermark = agreement.last_usn,
                "cycle incomplete, next cycle re-fetches from old watermark"
            );
        }

        let mut metrics = self.metrics.lock().await;
        let counters = metrics.agreement_mut(&agreement.id);
        for outcome in &tally.outcomes {
            counters.record_outcome(outcome);
        }
        counters.pages_fetched += tally.report.pages;
        counters.entries_retried += tally.report.retried;
        counters.entries_known += tally.report.known;
        counters.entries_dropped += tally.report.dropped;
        counters.unresolved_conflicts += tally.report.unresolved;
        counters.watermark = tally.report.watermark;
        if tally.report.committed {
            counters.cycles_completed += 1;
        } else {
            counters.cycles_incomplete += 1;
        }
        tally.report
    }

    async fn commit(&self, agreement: &ReplicationAgreement, cookie: &Cookie) -> Result<()> {
        self.agreements
            .set_watermark(self.backend.as_ref(), &agreement.id, cookie.partner_usn)
            .await?;
        let moved = self.utdv.merge_cookie(cookie).await;
        self.utdv.persist(self.backend.as_ref(), &self.config.base_dn).await?;
        tracing::debug!(
            agreement = %agreement.id,
            watermark = cookie.partner_usn,
            vector_moved = moved,
            "cookie committed"
        );
        Ok(())
    }

    /// Page through the partner; returns the sync-done cookie when the pull
    /// reached its last page.
    async fn pull_pages(
        &self,
        agreement: &ReplicationAgreement,
        session: &mut dyn PartnerSession,
        tally: &mut PassTally,
    ) -> Option<Cookie> {
        let mut retry: VecDeque<PageEntry> = VecDeque::new();
        let mut request = SearchRequest {
            since_usn: agreement.last_usn,
            page_size: self.config.page_size,
            paging_cookie: None,
            up_to_date: self.request_vector().await,
        };

        let sync_done = loop {
            if self.shutting_down() {
                self.flag_recovery(&agreement.id);
                tally.report.fatal = Some(ReplError::Shutdown.code().to_string());
                break None;
            }
            self.set_state(CycleState::Paging, Some(&agreement.id));
            let page = match session.fetch_page(&request).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(agreement = %agreement.id, error = %e, "page fetch failed");
                    self.flag_recovery(&agreement.id);
                    tally.report.fatal = Some(e.code().to_string());
                    break None;
                }
            };
            tally.report.pages += 1;

            let mut fatal = None;
            for mut item in page.entries {
                if self.already_known(&item).await {
                    tally.report.known += 1;
                    continue;
                }
                match self.apply_item(&item) {
                    Ok(outcome) => {
                        tally.report.applied += 1;
                        tally.outcomes.push(outcome);
                    }
                    Err(e) if e.is_transient() => {
                        tracing::debug!(agreement = %agreement.id, dn = %item.dn, error = %e, "queued for retry");
                        self.flag_recovery(&agreement.id);
                        item.last_error = Some(e.code().to_string());
                        retry.push_back(item);
                    }
                    Err(e) if e.is_unresolved_conflict() => {
                        tracing::warn!(agreement = %agreement.id, dn = %item.dn, error = %e, "{}", UNRESOLVED_MSG);
                        tally.report.unresolved += 1;
                    }
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }

            if fatal.is_none() && !retry.is_empty() {
                self.set_state(CycleState::Retrying, Some(&agreement.id));
                if let Err(e) = self.drain_retry(agreement, &mut retry, tally) {
                    fatal = Some(e);
                }
            }
            if let Some(e) = fatal {
                tracing::error!(agreement = %agreement.id, error = %e, "fatal error, abandoning agreement for this cycle");
                self.flag_recovery(&agreement.id);
                tally.report.fatal = Some(e.code().to_string());
                break None;
            }

            if page.paging_cookie.is_none() {
                break page.sync_done;
            }
            request.paging_cookie = page.paging_cookie;
        };

        for item in retry.drain(..) {
            tracing::warn!(
                agreement = %agreement.id,
                dn = %item.dn,
                partner_usn = item.partner_usn,
                last_error = item.last_error.as_deref().unwrap_or("unknown"),
                "{}",
                UNRESOLVED_MSG
            );
            tally.report.dropped += 1;
        }
        sync_done
    }

    /// Re-apply queued entries in FIFO order for as long as each pass shrinks
    /// the queue.
    fn drain_retry(
        &self,
        agreement: &ReplicationAgreement,
        retry: &mut VecDeque<PageEntry>,
        tally: &mut PassTally,
    ) -> Result<()> {
        loop {
            let before = retry.len();
            if before == 0 {
                return Ok(());
            }
            for _ in 0..before {
                let Some(mut item) = retry.pop_front() else {
                    break;
                };
                match self.apply_item(&item) {
                    Ok(outcome) => {
                        tracing::debug!(agreement = %agreement.id, dn = %item.dn, "retry succeeded");
                        tally.report.retried += 1;
                        tally.outcomes.push(outcome);
                    }
                    Err(e) if e.is_transient() => {
                        item.last_error = Some(e.code().to_string());
                        retry.push_back(item);
                    }
                    Err(e) if e.is_unresolved_conflict() => {
                        tracing::warn!(agreement = %agreement.id, dn = %item.dn, error = %e, "{}", UNRESOLVED_MSG);
                        tally.report.unresolved += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            if retry.len() >= before {
                tracing::debug!(agreement = %agreement.id, remaining = retry.len(), "retry queue stopped shrinking");
                return Ok(());
            }
        }
    }

    /// Spawn the run loop and return its handle.
    pub fn start(self) -> EngineHandle {
        let wake = Arc::new(Notify::new());
        let status = self.status_tx.subscribe();
        let shutdown = self.shutdown_tx.clone();
        let recovery = self.recovery.clone();
        let metrics = self.metrics.clone();
        let credentials = self.credentials.clone();
        let task = tokio::spawn(self.run(wake.clone()));
        EngineHandle {
            wake,
            shutdown,
            status,
            recovery,
            metrics,
            credentials,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, wake: Arc<Notify>) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.cycle_interval) => {}
                _ = wake.notified() => {
                    tracing::debug!("replicate-now requested");
                }
                _ = shutdown.changed() => {}
            }
        }
        self.set_state(CycleState::Stopped, None);
        tracing::info!(cycles = self.cycles, "replication engine stopped");
    }
}

/// Handle to a running engine.
pub struct EngineHandle {
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<EngineStatus>,
    recovery: Arc<AtomicBool>,
    metrics: Arc<Mutex<MetricsRegistry>>,
    credentials: Arc<RwLock<Credentials>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHandle {
    /// Wake the engine for an immediate cycle.
    pub fn replicate_now(&self) {
        self.wake.notify_one();
    }

    /// Snapshot of the engine status.
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Whether the last cycle hit an application failure.
    pub fn is_recovering(&self) -> bool {
        self.recovery.load(Ordering::SeqCst)
    }

    /// Shared metrics registry.
    pub fn metrics(&self) -> Arc<Mutex<MetricsRegistry>> {
        self.metrics.clone()
    }

    /// Shared credential store.
    pub fn credentials(&self) -> Arc<RwLock<Credentials>> {
        self.credentials.clone()
    }

    /// Wait until a cycle numbered above `after` finished.
    pub async fn wait_for_cycle_after(&self, after: u64) -> Result<CycleReport> {
        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                if current.cycles_run > after {
                    if let Some(report) = &current.last_report {
                        return Ok(report.clone());
                    }
                }
                if current.state == CycleState::Stopped {
                    return Err(ReplError::Shutdown);
                }
            }
            status.changed().await.map_err(|_| ReplError::Shutdown)?;
        }
    }

    /// Trigger a cycle and wait for it to finish.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        let after = {
            let status = self.status.borrow();
            match status.state {
                CycleState::Idle => status.cycles_run,
                _ => status.cycles_run + 1,
            }
        };
        self.replicate_now();
        self.wait_for_cycle_after(after).await
    }

    /// Stop the run loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "replication engine task failed");
            }
        }
    }
}

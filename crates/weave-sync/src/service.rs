//! The syndication service.
//!
//! Drives bidirectional sync between the local ledger and every registered
//! peer. A round pulls missing events from each connected peer, admits them
//! through the ledger's validation path, and pushes back whatever the peer's
//! reported heads do not cover.
//!
//! Only one round runs at a time. Failed peers are retried in the background
//! with exponential backoff, and every background task observes a shared
//! shutdown signal so nothing touches the ledger after [`SyndicationService::stop`].

use crate::config::SyndicationConfig;
use crate::error::{Result, SyncError, TransportError};
use crate::peer::{Peer, PeerId, PeerRegistry, PeerStatus};
use crate::protocol::{SyncRequest, SyncResult};
use crate::transport::Transport;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use weave_ledger::{causal_order, EventId, EventPayload, LedgerEvent, SharedLedger};

/// Aggregate view over the peer registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyndicationStats {
    pub total_peers: usize,
    pub connected: usize,
    pub syncing: usize,
    pub error: usize,
    pub disconnected: usize,
    pub events_received: u64,
    pub events_sent: u64,
    pub sync_in_progress: bool,
    pub running: bool,
}

/// Peer lifecycle and gossip sync over a [`Transport`].
pub struct SyndicationService<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for SyndicationService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport> {
    config: SyndicationConfig,
    ledger: SharedLedger,
    transport: Arc<T>,
    registry: PeerRegistry,
    /// Serializes each peer's state transitions.
    peer_locks: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
    running: AtomicBool,
    sync_in_progress: AtomicBool,
    /// Retry tasks currently inside an exchange.
    retries_in_flight: AtomicUsize,
    /// Signalled whenever a round or an in-flight retry ends.
    sync_finished: Notify,
    shutdown: watch::Sender<bool>,
    /// Auto-sync loop and pending retry timers.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the in-progress flag when a round ends, however it ends.
struct RoundGuard<'a> {
    flag: &'a AtomicBool,
    finished: &'a Notify,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.finished.notify_waiters();
    }
}

/// Counts a retry as in flight until dropped.
struct RetryGuard<'a> {
    count: &'a AtomicUsize,
    finished: &'a Notify,
}

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.finished.notify_waiters();
    }
}

impl<T: Transport> SyndicationService<T> {
    /// Create a new service. Configured peers are registered as disconnected.
    pub fn new(config: SyndicationConfig, ledger: SharedLedger, transport: Arc<T>) -> Self {
        let config = config.sanitized();
        let registry = PeerRegistry::new();
        for endpoint in &config.peers {
            registry.add(endpoint);
        }
        let (shutdown, _) = watch::channel(true);

        Self {
            inner: Arc::new(Inner {
                config,
                ledger,
                transport,
                registry,
                peer_locks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                sync_in_progress: AtomicBool::new(false),
                retries_in_flight: AtomicUsize::new(0),
                sync_finished: Notify::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SyndicationConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.inner.ledger
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.sync_in_progress.load(Ordering::SeqCst)
    }

    /// Connect to every registered peer and start the auto-sync loop.
    ///
    /// Connection attempts run concurrently; failures are logged and leave the
    /// peer in `Error` without affecting the others.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(false);

        let ids: Vec<PeerId> = self.inner.registry.all().into_iter().map(|p| p.id).collect();
        let outcomes = join_all(ids.iter().map(|id| self.inner.connect_peer(id))).await;
        let connected = outcomes.iter().filter(|r| r.is_ok()).count();
        tracing::info!(
            connected,
            failed = outcomes.len() - connected,
            auto_sync = self.inner.config.auto_sync,
            "syndication started"
        );

        if self.inner.config.auto_sync {
            self.inner.spawn_auto_sync();
        }
    }

    /// Stop syncing and disconnect from every peer.
    ///
    /// Cancels the auto-sync loop and pending retries, waits up to
    /// `shutdown_timeout` for an in-flight round or retry, then marks all
    /// peers disconnected and clears their retry counters.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let timeout = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.inner.wait_for_idle()).await.is_err() {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "sync still running at shutdown, proceeding anyway"
            );
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }

        let peers = self.inner.registry.all();
        for peer in peers.iter().filter(|p| p.status != PeerStatus::Disconnected) {
            let result = tokio::time::timeout(
                self.inner.config.request_timeout(),
                self.inner.transport.disconnect(peer),
            )
            .await;
            if !matches!(result, Ok(Ok(()))) {
                tracing::debug!(peer_id = %peer.id, "disconnect was not acknowledged");
            }
        }
        self.inner.registry.update_all(|peer| {
            peer.status = PeerStatus::Disconnected;
            peer.retry_attempts = 0;
        });
        tracing::info!(peers = peers.len(), "syndication stopped");
    }

    /// Run one sync round against every connected peer.
    ///
    /// Returns an empty list without doing anything if a round is already in
    /// progress.
    pub async fn sync_with_all_peers(&self) -> Vec<SyncResult> {
        self.inner.sync_round().await
    }

    /// Sync with a single peer, connecting first if needed.
    ///
    /// Sync failures are reported in the returned [`SyncResult`]; only an
    /// unknown peer is an `Err`.
    pub async fn sync_with_peer(&self, peer_id: &PeerId) -> Result<SyncResult> {
        if !self.inner.registry.contains(peer_id) {
            return Err(SyncError::PeerNotFound(peer_id.clone()));
        }
        Ok(self.inner.sync_peer(peer_id).await)
    }

    /// Register a peer. While running, a connection is attempted right away.
    pub async fn add_peer(&self, endpoint: &str) -> PeerId {
        let (id, added) = self.inner.registry.add(endpoint);
        if added {
            tracing::info!(peer_id = %id, endpoint, "peer added");
            if self.is_running() {
                // Failure is already recorded on the peer.
                let _ = self.inner.connect_peer(&id).await;
            }
        }
        id
    }

    /// Forget a peer. Returns false if it was not registered.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let Some(peer) = self.inner.registry.remove(peer_id) else {
            return false;
        };
        self.inner.peer_locks.lock().remove(peer_id);
        if peer.status != PeerStatus::Disconnected {
            let result = tokio::time::timeout(
                self.inner.config.request_timeout(),
                self.inner.transport.disconnect(&peer),
            )
            .await;
            if !matches!(result, Ok(Ok(()))) {
                tracing::debug!(peer_id = %peer_id, "disconnect was not acknowledged");
            }
        }
        tracing::info!(peer_id = %peer_id, "peer removed");
        true
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.inner.registry.get(peer_id)
    }

    pub fn get_all_peers(&self) -> Vec<Peer> {
        self.inner.registry.all()
    }

    pub fn get_connected_peers(&self) -> Vec<Peer> {
        self.inner.registry.with_status(PeerStatus::Connected)
    }

    pub fn get_error_peers(&self) -> Vec<Peer> {
        self.inner.registry.with_status(PeerStatus::Error)
    }

    pub fn get_stats(&self) -> SyndicationStats {
        let peers = self.inner.registry.all();
        let count = |status: PeerStatus| peers.iter().filter(|p| p.status == status).count();
        SyndicationStats {
            total_peers: peers.len(),
            connected: count(PeerStatus::Connected),
            syncing: count(PeerStatus::Syncing),
            error: count(PeerStatus::Error),
            disconnected: count(PeerStatus::Disconnected),
            events_received: peers.iter().map(|p| p.events_received).sum(),
            events_sent: peers.iter().map(|p| p.events_sent).sum(),
            sync_in_progress: self.is_syncing(),
            running: self.is_running(),
        }
    }
}

impl<T: Transport> Inner<T> {
    fn peer_lock(&self, peer_id: &PeerId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.peer_locks.lock().entry(peer_id.clone()).or_default())
    }

    /// Bound a transport call by `request_timeout`.
    async fn call<R>(
        &self,
        request: impl Future<Output = std::result::Result<R, TransportError>>,
    ) -> std::result::Result<R, TransportError> {
        let timeout = self.config.request_timeout();
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    fn is_idle(&self) -> bool {
        !self.sync_in_progress.load(Ordering::SeqCst)
            && self.retries_in_flight.load(Ordering::SeqCst) == 0
    }

    async fn wait_for_idle(&self) {
        loop {
            let finished = self.sync_finished.notified();
            if self.is_idle() {
                return;
            }
            finished.await;
        }
    }

    async fn connect_peer(&self, peer_id: &PeerId) -> Result<()> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        self.handshake(peer_id).await
    }

    /// Handshake with a peer. Caller holds the peer's lock.
    async fn handshake(&self, peer_id: &PeerId) -> Result<()> {
        let peer = self
            .registry
            .get(peer_id)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.clone()))?;

        let started = Instant::now();
        match self.call(self.transport.handshake(&peer)).await {
            Ok(()) => {
                let latency = started.elapsed();
                self.registry.update(peer_id, |p| {
                    p.status = PeerStatus::Connected;
                    p.latency = Some(latency);
                });
                tracing::info!(
                    peer_id = %peer_id,
                    endpoint = %peer.endpoint,
                    latency_ms = latency.as_millis() as u64,
                    "connected to peer"
                );
                Ok(())
            }
            Err(err) => {
                self.registry.update(peer_id, |p| p.record_failure(err.to_string()));
                tracing::warn!(peer_id = %peer_id, endpoint = %peer.endpoint, error = %err, "failed to connect to peer");
                Err(err.into())
            }
        }
    }

    async fn sync_round(self: &Arc<Self>) -> Vec<SyncResult> {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync round already in progress, skipping");
            return Vec::new();
        }
        let _round = RoundGuard {
            flag: &self.sync_in_progress,
            finished: &self.sync_finished,
        };

        let ids: Vec<PeerId> = self
            .registry
            .with_status(PeerStatus::Connected)
            .into_iter()
            .map(|p| p.id)
            .collect();
        let results = join_all(ids.iter().map(|id| self.sync_peer(id))).await;

        for result in results.iter().filter(|r| !r.success) {
            self.schedule_retry(result.peer_id.clone());
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(
            peers = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            "sync round finished"
        );
        results
    }

    async fn sync_peer(&self, peer_id: &PeerId) -> SyncResult {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        let started = Instant::now();

        match self.exchange(peer_id, started).await {
            Ok(result) => result,
            Err(err) => {
                self.registry.update(peer_id, |p| p.record_failure(err.to_string()));
                tracing::warn!(peer_id = %peer_id, error = %err, "sync with peer failed");
                SyncResult::failed(peer_id.clone(), started.elapsed(), err.to_string())
            }
        }
    }

    /// Pull, admit, push. Caller holds the peer's lock.
    ///
    /// The pull pages through the peer's backlog while it reports more. Each
    /// request advertises the local tips plus the frontier of what the peer is
    /// known to hold, so history hidden behind unshared local events is not
    /// served again.
    async fn exchange(&self, peer_id: &PeerId, started: Instant) -> Result<SyncResult> {
        let status = self
            .registry
            .get(peer_id)
            .map(|p| p.status)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.clone()))?;
        if status != PeerStatus::Connected {
            self.handshake(peer_id).await?;
        }

        let peer = self
            .registry
            .update(peer_id, |p| {
                p.status = PeerStatus::Syncing;
                p.clone()
            })
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.clone()))?;
        let tips_before = self.ledger.tips();
        self.ledger.append_event(EventPayload::SyncStarted {
            peer_id: peer_id.to_string(),
        })?;

        let max_events = self.config.max_events_per_sync;
        let mut known = self.ledger.read().frontier_of(&peer.known_heads);
        let mut received = 0;
        let mut rejected = 0;
        let mut pages = 0;
        let response = loop {
            let request = SyncRequest::from_ledger(&self.ledger.read(), max_events)
                .with_known(tips_before.iter().chain(&known).copied());
            let mut response = self
                .call(self.transport.fetch_from_peer(&peer, request))
                .await?;
            pages += 1;

            let events = std::mem::take(&mut response.events);
            let mut seen: Vec<EventId> = events.iter().map(|e| e.id).collect();
            let (accepted, bad) = self.admit(peer_id, events)?;
            received += accepted;
            rejected += bad;

            seen.extend(known.iter().copied());
            seen.extend(response.heads.iter().copied());
            let before = std::mem::replace(&mut known, self.ledger.read().frontier_of(&seen));
            if !response.has_more || (accepted == 0 && known == before) {
                break response;
            }
            tracing::debug!(peer_id = %peer_id, page = pages, received, "peer has more events");
        };

        let (outgoing, push_more) = self.ledger.read().events_unknown_to(&known, max_events);
        let sent = if outgoing.is_empty() {
            0
        } else {
            let pushed: Vec<EventId> = outgoing.iter().map(|e| e.id).collect();
            let sent = self.call(self.transport.send_to_peer(&peer, outgoing)).await?;
            if sent == pushed.len() {
                let mut seen = pushed;
                seen.extend(known.iter().copied());
                known = self.ledger.read().frontier_of(&seen);
            }
            sent
        };

        let new_checkpoint_height = response.checkpoint.as_ref().map(|c| c.height);
        self.registry.update(peer_id, |p| {
            p.status = PeerStatus::Connected;
            p.events_received += received as u64;
            p.events_sent += sent as u64;
            p.last_sync_time = Some(SystemTime::now());
            p.last_error = None;
            p.retry_attempts = 0;
            if new_checkpoint_height.is_some() {
                p.last_checkpoint_height = new_checkpoint_height;
            }
            p.known_heads = known.clone();
        });
        self.ledger.append_event(EventPayload::SyncCompleted {
            peer_id: peer_id.to_string(),
            events_received: received as u64,
            events_sent: sent as u64,
        })?;

        let duration = started.elapsed();
        tracing::info!(
            peer_id = %peer_id,
            received,
            rejected,
            sent,
            pages,
            pull_more = response.has_more,
            push_more,
            duration_ms = duration.as_millis() as u64,
            "synced with peer"
        );
        Ok(SyncResult {
            peer_id: peer_id.clone(),
            success: true,
            events_received: received,
            events_rejected: rejected,
            events_sent: sent,
            new_checkpoint_height,
            duration,
            error: None,
        })
    }

    /// Feed received events through validation. Returns (accepted, rejected).
    fn admit(&self, peer_id: &PeerId, events: Vec<LedgerEvent>) -> Result<(usize, usize)> {
        let mut accepted = 0;
        let mut rejected = 0;
        for event in causal_order(events) {
            let event_id = event.id;
            let validation = self.ledger.validate_and_insert(event)?;
            if validation.is_new() {
                accepted += 1;
            } else if !validation.valid {
                rejected += 1;
                tracing::warn!(
                    peer_id = %peer_id,
                    event_id = %event_id.short(),
                    errors = ?validation.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
                    "peer sent an invalid event"
                );
            }
        }
        Ok((accepted, rejected))
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn spawn_auto_sync(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.sync_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.sync_round().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.track(task);
    }

    /// Retry a failed peer after a backoff delay, up to `max_attempts` times.
    fn schedule_retry(self: &Arc<Self>, peer_id: PeerId) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let policy = &self.config.retry;
        let Some(attempt) = self.registry.update(&peer_id, |p| {
            let attempt = p.retry_attempts;
            if attempt < policy.max_attempts {
                p.retry_attempts += 1;
            }
            attempt
        }) else {
            return;
        };
        if attempt >= policy.max_attempts {
            tracing::error!(
                peer_id = %peer_id,
                attempts = attempt,
                "max retries exceeded, leaving peer in error state"
            );
            return;
        }

        let delay = policy.next_delay(attempt);
        tracing::debug!(
            peer_id = %peer_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling sync retry"
        );

        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            // Counted before the running check so `stop` either sees this
            // retry or this retry sees `stop`.
            inner.retries_in_flight.fetch_add(1, Ordering::SeqCst);
            let _in_flight = RetryGuard {
                count: &inner.retries_in_flight,
                finished: &inner.sync_finished,
            };
            if !inner.running.load(Ordering::SeqCst) || !inner.registry.contains(&peer_id) {
                return;
            }
            let result = inner.sync_peer(&peer_id).await;
            if !result.success {
                inner.schedule_retry(peer_id);
            }
        });
        self.track(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyndicationConfigBuilder;
    use crate::transport::MemoryNetwork;
    use weave_ledger::{AgentKeypair, Ledger, LedgerConfig};

    fn shared(secret: u8) -> SharedLedger {
        SharedLedger::new(Ledger::in_memory(
            LedgerConfig::default(),
            AgentKeypair::from_secret([secret; 32]),
        ))
    }

    #[tokio::test]
    async fn test_new_registers_configured_peers() {
        let network = MemoryNetwork::new();
        let config = SyndicationConfigBuilder::new()
            .peer("mem://a")
            .peer("mem://b")
            .peer("mem://a")
            .auto_sync(false)
            .build();
        let service = SyndicationService::new(config, shared(1), Arc::new(network.transport()));

        let peers = service.get_all_peers();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| p.status == PeerStatus::Disconnected));
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_unknown_peer_is_an_error() {
        let network = MemoryNetwork::new();
        let service = SyndicationService::new(
            SyndicationConfig::default(),
            shared(1),
            Arc::new(network.transport()),
        );
        let result = service.sync_with_peer(&PeerId::new("peer-missing")).await;
        assert!(matches!(result, Err(SyncError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_stats_reflect_peer_states() {
        let network = MemoryNetwork::new();
        network.register("mem://up", shared(2));
        let config = SyndicationConfigBuilder::new()
            .peer("mem://up")
            .peer("mem://down")
            .auto_sync(false)
            .build();
        let service = SyndicationService::new(config, shared(1), Arc::new(network.transport()));
        service.start().await;

        let stats = service.get_stats();
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.error, 1);
        assert!(stats.running);
        assert!(!stats.sync_in_progress);

        service.stop().await;
        let stats = service.get_stats();
        assert_eq!(stats.disconnected, 2);
        assert!(!stats.running);
    }
}

//! The pool for one (provider, model) pair.
//!
//! Live connections are `idle + busy + connecting` and never exceed the
//! profile's `max_connections`. When the pool is full, callers park in a
//! priority heap. A released connection is handed straight to the best
//! waiter; a retired one frees a slot that the best waiter then fills by
//! opening a fresh connection.
//!
//! Grants travel through oneshot channels as guard types, so a waiter that
//! gives up (timeout or cancellation) can never leak a connection or a slot:
//! whatever is left in the channel is returned to the pool on drop.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::connection::{ConnectionState, PooledConnection};
use super::profile::ProviderProfile;
use crate::providers::{UpstreamConnection, UpstreamProvider};
use crate::types::PriorityClass;
use crate::{HuginnError, Result, telemetry};

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub provider: String,
    pub model: String,
    /// Live connections, including ones being opened.
    pub size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub reused: u64,
    pub errors: u64,
    pub retired: u64,
    pub timeouts: u64,
    pub served: u64,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub retired: usize,
    pub pinged: usize,
    pub opened: usize,
}

impl MaintenanceReport {
    pub(crate) fn merge(&mut self, other: MaintenanceReport) {
        self.retired += other.retired;
        self.pinged += other.pinged;
        self.opened += other.opened;
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    errors: AtomicU64,
    retired: AtomicU64,
    timeouts: AtomicU64,
    served: AtomicU64,
}

struct Waiter {
    priority: PriorityClass,
    seq: u64,
    tx: oneshot::Sender<Grant>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PairState {
    idle: VecDeque<PooledConnection>,
    busy: usize,
    connecting: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
    closed: bool,
}

impl PairState {
    fn live(&self) -> usize {
        self.idle.len() + self.busy + self.connecting
    }

    /// Pop the best waiter that is still listening.
    fn pop_waiter(&mut self) -> Option<Waiter> {
        while let Some(waiter) = self.waiters.pop() {
            if !waiter.tx.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }
}

enum Grant {
    Connection(ConnectionHandle),
    Slot(SlotReservation),
}

impl Grant {
    fn into_connection(self) -> Option<PooledConnection> {
        match self {
            Grant::Connection(mut handle) => handle.conn.take(),
            Grant::Slot(_) => None,
        }
    }
}

/// Capacity reserved for a connection that is about to be opened.
struct SlotReservation {
    pool: Arc<ConnectionPool>,
    armed: bool,
}

impl SlotReservation {
    fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon_slot();
        }
    }
}

/// A checked-out connection.
///
/// Call [`release`](Self::release) with the outcome of the request. Dropping
/// the handle without releasing returns the connection uncounted.
pub struct ConnectionHandle {
    pool: Arc<ConnectionPool>,
    upstream: Arc<dyn UpstreamConnection>,
    conn: Option<PooledConnection>,
}

impl ConnectionHandle {
    fn new(pool: Arc<ConnectionPool>, conn: PooledConnection) -> Self {
        Self {
            pool,
            upstream: Arc::clone(&conn.upstream),
            conn: Some(conn),
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.id)
    }

    pub fn provider(&self) -> &str {
        &self.pool.provider_name
    }

    pub fn model(&self) -> &str {
        &self.pool.model
    }

    /// Requests served before this checkout.
    pub fn requests_served(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.requests_served)
    }

    /// The upstream connection to call.
    pub fn upstream(&self) -> Arc<dyn UpstreamConnection> {
        Arc::clone(&self.upstream)
    }

    /// Return the connection, recording one served request.
    pub fn release(mut self, ok: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, Some(ok));
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, None);
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("provider", &self.pool.provider_name)
            .field("model", &self.pool.model)
            .field("conn", &self.conn)
            .finish()
    }
}

enum Step {
    Ready(PooledConnection),
    Open,
    Wait(oneshot::Receiver<Grant>),
}

/// Bounded set of reusable connections for one (provider, model).
pub struct ConnectionPool {
    provider_name: String,
    model: String,
    profile: ProviderProfile,
    provider: Arc<dyn UpstreamProvider>,
    state: Mutex<PairState>,
    next_id: AtomicU64,
    counters: Counters,
}

impl ConnectionPool {
    pub fn new(
        provider: Arc<dyn UpstreamProvider>,
        model: impl Into<String>,
        profile: ProviderProfile,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider_name: provider.name().to_owned(),
            model: model.into(),
            profile,
            provider,
            state: Mutex::new(PairState::default()),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider_name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn lock(&self) -> MutexGuard<'_, PairState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self) -> usize {
        self.profile.max_connections.max(1)
    }

    /// Check out a connection.
    ///
    /// Reuses an idle connection, opens one if under capacity, or waits
    /// (priority then arrival) up to the profile's acquire timeout.
    #[instrument(skip(self), fields(provider = %self.provider_name, model = %self.model))]
    pub async fn acquire(self: &Arc<Self>, priority: PriorityClass) -> Result<ConnectionHandle> {
        let step = {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            state.prune_waiters();
            let mut step = None;
            if state.waiters.is_empty() {
                if let Some(mut conn) = state.idle.pop_back() {
                    conn.state = ConnectionState::Busy;
                    state.busy += 1;
                    step = Some(Step::Ready(conn));
                } else if state.live() < self.capacity() {
                    state.connecting += 1;
                    step = Some(Step::Open);
                }
            }
            match step {
                Some(step) => step,
                None => {
                    let (tx, rx) = oneshot::channel();
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.waiters.push(Waiter { priority, seq, tx });
                    Step::Wait(rx)
                }
            }
        };

        match step {
            Step::Ready(conn) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                debug!(connection = conn.id, "reusing idle connection");
                Ok(ConnectionHandle::new(Arc::clone(self), conn))
            }
            Step::Open => self.open(SlotReservation::new(Arc::clone(self))).await,
            Step::Wait(rx) => self.wait(rx).await,
        }
    }

    async fn wait(self: &Arc<Self>, mut rx: oneshot::Receiver<Grant>) -> Result<ConnectionHandle> {
        let waited = self.profile.acquire_timeout;
        let grant = match tokio::time::timeout(waited, &mut rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                // A grant may have landed between the deadline and close().
                rx.close();
                match rx.try_recv() {
                    Ok(grant) => grant,
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(
                            telemetry::POOL_TIMEOUTS_TOTAL,
                            "provider" => self.provider_name.clone()
                        )
                        .increment(1);
                        warn!(
                            provider = %self.provider_name,
                            model = %self.model,
                            waited_ms = waited.as_millis() as u64,
                            "pool acquire timed out"
                        );
                        return Err(HuginnError::PoolTimeout {
                            provider: self.provider_name.clone(),
                            model: self.model.clone(),
                            waited,
                        });
                    }
                }
            }
        };
        match grant {
            Grant::Connection(handle) => Ok(handle),
            Grant::Slot(reservation) => self.open(reservation).await,
        }
    }

    /// Open a connection into a reserved slot.
    async fn open(self: &Arc<Self>, reservation: SlotReservation) -> Result<ConnectionHandle> {
        let upstream = self.connect().await?;
        reservation.disarm();
        let conn = self.adopt(upstream);
        Ok(ConnectionHandle::new(Arc::clone(self), conn))
    }

    async fn connect(&self) -> Result<Arc<dyn UpstreamConnection>> {
        match tokio::time::timeout(self.profile.timeout, self.provider.connect(&self.model)).await
        {
            Ok(result) => result,
            Err(_) => Err(HuginnError::upstream(
                &self.provider_name,
                &self.model,
                format!("connect timed out after {:?}", self.profile.timeout),
            )),
        }
    }

    /// Turn a reserved slot into a busy connection.
    fn adopt(&self, upstream: Arc<dyn UpstreamConnection>) -> PooledConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.lock();
            state.connecting = state.connecting.saturating_sub(1);
            state.busy += 1;
        }
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(
            provider = %self.provider_name,
            model = %self.model,
            connection = id,
            "opened connection"
        );
        PooledConnection::new(
            id,
            &self.provider_name,
            &self.model,
            self.profile.max_requests_per_connection,
            upstream,
        )
    }

    fn check_in(self: &Arc<Self>, mut conn: PooledConnection, outcome: Option<bool>) {
        if let Some(ok) = outcome {
            conn.requests_served += 1;
            self.counters.served.fetch_add(1, Ordering::Relaxed);
            if !ok {
                conn.errors += 1;
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        conn.last_used_at = Instant::now();

        let reason = if conn.exhausted() {
            Some("max_requests")
        } else if conn.requests_served > self.profile.error_rate_min_requests
            && conn.error_rate() > self.profile.error_rate_threshold
        {
            Some("error_rate")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                self.lock().busy -= 1;
                self.record_retired(&conn, reason);
                self.hand_off_slot();
            }
            None => self.return_connection(conn),
        }
    }

    /// Give a busy connection to the best waiter, or park it idle.
    fn return_connection(self: &Arc<Self>, mut conn: PooledConnection) {
        loop {
            let waiter = {
                let mut state = self.lock();
                if state.closed {
                    state.busy -= 1;
                    drop(state);
                    self.record_retired(&conn, "closed");
                    return;
                }
                match state.pop_waiter() {
                    Some(waiter) => waiter,
                    None => {
                        state.busy -= 1;
                        conn.state = ConnectionState::Idle;
                        state.idle.push_back(conn);
                        return;
                    }
                }
            };
            let handle = ConnectionHandle::new(Arc::clone(self), conn);
            match waiter.tx.send(Grant::Connection(handle)) {
                Ok(()) => {
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(grant) => match grant.into_connection() {
                    Some(returned) => conn = returned,
                    None => return,
                },
            }
        }
    }

    /// Offer freed capacity to the best waiter.
    fn hand_off_slot(self: &Arc<Self>) {
        let waiter = {
            let mut state = self.lock();
            if state.closed || state.live() >= self.capacity() {
                return;
            }
            match state.pop_waiter() {
                Some(waiter) => {
                    state.connecting += 1;
                    waiter
                }
                None => return,
            }
        };
        // A failed send drops the reservation, which re-offers the slot.
        let _ = waiter
            .tx
            .send(Grant::Slot(SlotReservation::new(Arc::clone(self))));
    }

    fn abandon_slot(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.connecting = state.connecting.saturating_sub(1);
        }
        self.hand_off_slot();
    }

    fn record_retired(&self, conn: &PooledConnection, reason: &'static str) {
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            telemetry::POOL_RETIRED_TOTAL,
            "provider" => self.provider_name.clone(),
            "reason" => reason
        )
        .increment(1);
        debug!(
            provider = %self.provider_name,
            model = %self.model,
            connection = conn.id,
            served = conn.requests_served,
            errors = conn.errors,
            reason,
            "retired connection"
        );
    }

    /// Retire stale idle connections, probe keep-alive ones, and top the
    /// pool back up to `min_connections` for keep-alive providers.
    pub async fn maintain(self: &Arc<Self>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let now = Instant::now();

        let (stale, probes) = {
            let mut state = self.lock();
            if state.closed {
                return report;
            }
            let (stale, fresh): (Vec<_>, Vec<_>) = state.idle.drain(..).partition(|c| {
                c.idle_for(now) >= self.profile.max_idle || c.age(now) >= self.profile.max_age
            });
            state.idle = fresh.into();
            let probes: Vec<_> = if self.profile.keep_alive {
                state
                    .idle
                    .iter()
                    .map(|c| (c.id, Arc::clone(&c.upstream)))
                    .collect()
            } else {
                Vec::new()
            };
            (stale, probes)
        };
        for conn in &stale {
            let reason = if conn.age(now) >= self.profile.max_age {
                "max_age"
            } else {
                "idle"
            };
            self.record_retired(conn, reason);
        }
        report.retired += stale.len();

        for (id, upstream) in probes {
            report.pinged += 1;
            if let Err(e) = upstream.ping().await {
                warn!(
                    provider = %self.provider_name,
                    connection = id,
                    error = %e,
                    "keep-alive ping failed"
                );
                let removed = {
                    let mut state = self.lock();
                    let pos = state.idle.iter().position(|c| c.id == id);
                    pos.and_then(|i| state.idle.remove(i))
                };
                if let Some(conn) = removed {
                    self.record_retired(&conn, "ping");
                    report.retired += 1;
                }
            }
        }

        if report.retired > 0 {
            self.hand_off_slot();
        }
        if self.profile.keep_alive {
            report.opened = self.replenish().await;
        }
        report
    }

    async fn replenish(self: &Arc<Self>) -> usize {
        let floor = self.profile.min_connections.min(self.capacity());
        let mut opened = 0;
        loop {
            let reserved = {
                let mut state = self.lock();
                if state.closed || state.live() >= floor {
                    false
                } else {
                    state.connecting += 1;
                    true
                }
            };
            if !reserved {
                return opened;
            }
            let reservation = SlotReservation::new(Arc::clone(self));
            match self.connect().await {
                Ok(upstream) => {
                    reservation.disarm();
                    let conn = self.adopt(upstream);
                    self.return_connection(conn);
                    opened += 1;
                }
                Err(e) => {
                    warn!(
                        provider = %self.provider_name,
                        model = %self.model,
                        error = %e,
                        "keep-alive replenish failed"
                    );
                    return opened;
                }
            }
        }
    }

    /// Stop handing out connections.
    ///
    /// Waiters fail with [`HuginnError::PoolClosed`]; idle connections are
    /// retired now and busy ones when they come back.
    pub fn close(&self) {
        let (waiters, idle) = {
            let mut state = self.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.idle),
            )
        };
        drop(waiters);
        for conn in &idle {
            self.record_retired(conn, "closed");
        }
    }

    /// Close the pool and wait for busy connections to come back.
    ///
    /// Returns `false` if some were still out when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.close();
        let deadline = Instant::now() + timeout;
        loop {
            let outstanding = {
                let state = self.lock();
                state.busy + state.connecting
            };
            if outstanding == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    provider = %self.provider_name,
                    model = %self.model,
                    outstanding,
                    "pool drain timed out"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let (size, in_use, idle, waiting) = {
            let state = self.lock();
            let waiting = state.waiters.iter().filter(|w| !w.tx.is_closed()).count();
            (state.live(), state.busy, state.idle.len(), waiting)
        };
        PoolStats {
            provider: self.provider_name.clone(),
            model: self.model.clone(),
            size,
            in_use,
            idle,
            waiting,
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            served: self.counters.served.load(Ordering::Relaxed),
        }
    }

    fn closed_error(&self) -> HuginnError {
        HuginnError::PoolClosed {
            provider: self.provider_name.clone(),
            model: self.model.clone(),
        }
    }
}

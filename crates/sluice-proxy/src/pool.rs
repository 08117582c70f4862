//! Connection pool for pipelined upstream connections
//!
//! Connections are grouped per origin. Acquiring a slot prefers an idle
//! connection, then opens a new one while below the connection limit, then
//! pipelines onto the least loaded connection with depth left, and finally
//! queues (bounded) until a slot is released.

use crate::connection::{Connection, Fault, Slot};
use crate::stats::ProxyStats;
use dashmap::DashMap;
use parking_lot::Mutex;
use sluice_core::{Error, Origin, PoolSettings, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Connection pool keyed by upstream origin
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    settings: PoolSettings,
    origins: DashMap<Origin, Arc<OriginPool>>,
    cancel: CancellationToken,
    stats: Arc<ProxyStats>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct OriginPool {
    origin: Origin,
    state: Mutex<PoolState>,
    released: Arc<Notify>,
}

#[derive(Debug, Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    connecting: usize,
    waiting: usize,
}

enum Step {
    Ready(Slot),
    Connect(ConnectingGuard),
    Wait(Option<WaitingGuard>),
}

/// Counts a connection being opened; released on drop so a cancelled
/// connect gives the capacity back
struct ConnectingGuard {
    pool: Arc<OriginPool>,
    armed: bool,
}

impl ConnectingGuard {
    fn finish(mut self, state: &mut PoolState) {
        state.connecting = state.connecting.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.pool.state.lock();
                state.connecting = state.connecting.saturating_sub(1);
            }
            self.pool.released.notify_waiters();
        }
    }
}

/// Counts a queued caller
struct WaitingGuard {
    pool: Arc<OriginPool>,
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

impl ConnectionPool {
    pub(crate) fn new(settings: PoolSettings, stats: Arc<ProxyStats>) -> Self {
        Self {
            settings,
            origins: DashMap::new(),
            cancel: CancellationToken::new(),
            stats,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reserve a pipelining slot on a connection to `origin`
    pub(crate) async fn acquire(&self, origin: &Origin) -> Result<Slot> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let pool = self
            .origins
            .entry(origin.clone())
            .or_insert_with(|| {
                Arc::new(OriginPool {
                    origin: origin.clone(),
                    state: Mutex::new(PoolState::default()),
                    released: Arc::new(Notify::new()),
                })
            })
            .clone();
        let released = pool.released.clone();

        let mut waiting: Option<WaitingGuard> = None;
        loop {
            // Registered before planning so a release between the two is not missed.
            let notified = released.notified();

            match self.plan(&pool, waiting.is_some())? {
                Step::Ready(slot) => return Ok(slot),
                Step::Connect(guard) => {
                    drop(waiting.take());
                    return self.connect(&pool, guard).await;
                }
                Step::Wait(guard) => {
                    if guard.is_some() {
                        waiting = guard;
                        tracing::trace!(origin = %origin, "all upstream connections busy, queueing");
                    }
                    tokio::select! {
                        _ = notified => {}
                        _ = self.cancel.cancelled() => return Err(Error::Closed),
                    }
                }
            }
        }
    }

    fn plan(&self, pool: &Arc<OriginPool>, already_waiting: bool) -> Result<Step> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let depth = self.settings.pipelining;
        let mut state = pool.state.lock();
        state.connections.retain(|connection| connection.is_usable());

        let idle = state
            .connections
            .iter()
            .filter(|connection| connection.in_flight() == 0)
            .find_map(|connection| connection.try_reserve(depth));
        if let Some(slot) = idle {
            return Ok(Step::Ready(slot));
        }

        if state.connections.len() + state.connecting < self.settings.connections {
            state.connecting += 1;
            return Ok(Step::Connect(ConnectingGuard {
                pool: pool.clone(),
                armed: true,
            }));
        }

        let mut candidates: Vec<_> = state
            .connections
            .iter()
            .map(|connection| (connection.in_flight(), connection))
            .filter(|(in_flight, _)| *in_flight < depth)
            .collect();
        candidates.sort_by_key(|(in_flight, _)| *in_flight);
        if let Some(slot) = candidates
            .into_iter()
            .find_map(|(_, connection)| connection.try_reserve(depth))
        {
            return Ok(Step::Ready(slot));
        }

        if already_waiting {
            return Ok(Step::Wait(None));
        }

        if state.waiting < self.settings.max_queued {
            state.waiting += 1;
            return Ok(Step::Wait(Some(WaitingGuard { pool: pool.clone() })));
        }

        Err(Error::PoolExhausted(format!(
            "{} ({} connections saturated, {} callers queued)",
            pool.origin,
            state.connections.len(),
            state.waiting
        )))
    }

    async fn connect(&self, pool: &Arc<OriginPool>, guard: ConnectingGuard) -> Result<Slot> {
        let origin = &pool.origin;
        let timeout = self.settings.connect_timeout;

        let attempt = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            attempt = tokio::time::timeout(timeout, TcpStream::connect((origin.host(), origin.port()))) => attempt,
        };

        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(origin = %origin, error = %e, "upstream connect failed");
                return Err(Error::Unreachable {
                    origin: origin.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(origin = %origin, timeout = ?timeout, "upstream connect timed out");
                return Err(Error::Unreachable {
                    origin: origin.to_string(),
                    reason: format!("connect timed out after {timeout:?}"),
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(origin = %origin, error = %e, "failed to set TCP_NODELAY");
        }

        let connection = Connection::spawn(
            stream,
            self.next_id.fetch_add(1, Ordering::Relaxed),
            origin.clone(),
            self.cancel.child_token(),
            pool.released.clone(),
            self.stats.clone(),
            self.settings.keep_alive,
        );
        self.stats.record_connection_opened();

        let slot = {
            let mut state = pool.state.lock();
            guard.finish(&mut state);
            if self.is_closed() {
                None
            } else {
                let slot = connection.try_reserve(self.settings.pipelining);
                if slot.is_some() {
                    state.connections.push(connection.clone());
                }
                slot
            }
        };

        // New capacity for queued callers when pipelining is allowed.
        pool.released.notify_waiters();

        match slot {
            Some(slot) => Ok(slot),
            None if self.is_closed() => {
                connection.poison(Fault::Closed);
                Err(Error::Closed)
            }
            None => Err(Error::ConnectionReset(format!(
                "connection to {origin} closed before first use"
            ))),
        }
    }

    /// Close every connection and fail queued callers
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        for pool in self.origins.iter() {
            let connections = std::mem::take(&mut pool.state.lock().connections);
            for connection in connections {
                connection.poison(Fault::Closed);
            }
            pool.released.notify_waiters();
        }
    }

    /// Open, usable connections across all origins
    pub(crate) fn connection_count(&self) -> usize {
        self.origins
            .iter()
            .map(|pool| {
                pool.state
                    .lock()
                    .connections
                    .iter()
                    .filter(|connection| connection.is_usable())
                    .count()
            })
            .sum()
    }

    /// Exchanges currently holding a slot, across all origins
    pub(crate) fn in_flight(&self) -> usize {
        self.origins
            .iter()
            .map(|pool| {
                pool.state
                    .lock()
                    .connections
                    .iter()
                    .map(|connection| connection.in_flight())
                    .sum::<usize>()
            })
            .sum()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

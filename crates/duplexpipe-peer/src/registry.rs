//! Live connection registry and predicate fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::PeerError;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Targets that received the frame.
    pub delivered: usize,
    /// Targets whose send failed.
    pub failed: usize,
}

impl BroadcastReport {
    pub fn targets(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Connections currently owned by a server.
///
/// All access goes through one async mutex; it is only held long enough to
/// copy handles, never across I/O.
pub struct Registry<M> {
    members: Mutex<HashMap<ConnectionId, Connection<M>>>,
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> Registry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, connection: Connection<M>) {
        self.members.lock().await.insert(connection.id(), connection);
    }

    /// Remove a member. Returns `None` if it was already gone.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection<M>> {
        self.members.lock().await.remove(&id)
    }

    /// Handles to every connected member matching `predicate`.
    pub async fn snapshot<P>(&self, predicate: P) -> Vec<Connection<M>>
    where
        P: Fn(&Connection<M>) -> bool,
    {
        let members = self.members.lock().await;
        members
            .values()
            .filter(|conn| conn.is_connected() && predicate(conn))
            .cloned()
            .collect()
    }

    /// Number of members, including ones whose disconnect is still in flight.
    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    /// Remove and return every member.
    pub async fn drain(&self) -> Vec<Connection<M>> {
        self.members
            .lock()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }
}

impl<M: Send + 'static> Registry<M> {
    /// Send one serialized payload to every connected member matching
    /// `predicate`, at most `max_concurrency` sends at a time.
    ///
    /// Each target fails on its own: `on_failure` is called for it and the
    /// other sends carry on. A target that has not taken its frame within
    /// `send_timeout` is disconnected and counted as failed. Targets skipped
    /// because `cancel` fired are not reported as failures.
    pub async fn broadcast<P, F>(
        &self,
        payload: Bytes,
        predicate: P,
        max_concurrency: usize,
        send_timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut on_failure: F,
    ) -> BroadcastReport
    where
        P: Fn(&Connection<M>) -> bool,
        F: FnMut(Connection<M>, PeerError),
    {
        let targets = self.snapshot(predicate).await;
        let mut report = BroadcastReport::default();
        if targets.is_empty() {
            return report;
        }

        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut sends = JoinSet::new();
        for conn in targets {
            let permits = Arc::clone(&permits);
            let payload = payload.clone();
            let cancel = cancel.clone();
            sends.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => conn.send_payload(&payload, &cancel, send_timeout).await,
                    Err(_) => Err(PeerError::Cancelled),
                };
                (conn, result)
            });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((conn, Ok(()))) => {
                    trace!(connection_id = %conn.id(), "broadcast delivered");
                    report.delivered += 1;
                }
                Ok((_, Err(PeerError::Cancelled))) => {}
                Ok((conn, Err(err))) => {
                    warn!(connection_id = %conn.id(), error = %err, "broadcast target failed");
                    report.failed += 1;
                    on_failure(conn, err);
                }
                Err(err) => {
                    warn!(error = %err, "broadcast send task failed");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

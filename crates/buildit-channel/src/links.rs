//! Outbound half of the worker connections.

use buildit_core::{ConnectionId, LinkError, MasterMessage, Outbound, WorkerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Link {
    conn_id: ConnectionId,
    tx: mpsc::Sender<MasterMessage>,
    cancel: CancellationToken,
}

/// Current connection of every registered worker. At most one link per
/// worker; a newer registration replaces and closes the older one.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    links: Arc<Mutex<HashMap<WorkerId, Link>>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `conn_id` the worker's link. Returns the replaced connection.
    pub(crate) fn attach(
        &self,
        worker_id: WorkerId,
        conn_id: ConnectionId,
        tx: mpsc::Sender<MasterMessage>,
        cancel: CancellationToken,
    ) -> Option<ConnectionId> {
        let previous = self.lock().insert(worker_id.clone(), Link { conn_id, tx, cancel });
        previous.map(|old| {
            debug!(worker_id = %worker_id, old = %old.conn_id, new = %conn_id, "Replacing worker link");
            old.cancel.cancel();
            old.conn_id
        })
    }

    /// Remove the link if it still belongs to `conn_id`.
    pub(crate) fn remove(&self, worker_id: &WorkerId, conn_id: ConnectionId) -> bool {
        let mut links = self.lock();
        match links.get(worker_id) {
            Some(link) if link.conn_id == conn_id => {
                links.remove(worker_id);
                true
            }
            _ => false,
        }
    }

    pub fn connection(&self, worker_id: &WorkerId) -> Option<ConnectionId> {
        self.lock().get(worker_id).map(|link| link.conn_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close every connection.
    pub fn close_all(&self) {
        for (_, link) in self.lock().drain() {
            link.cancel.cancel();
        }
    }
}

impl Outbound for LinkTable {
    fn send(&self, worker_id: &WorkerId, message: MasterMessage) -> Result<(), LinkError> {
        let links = self.lock();
        let link = links
            .get(worker_id)
            .ok_or_else(|| LinkError::UnknownWorker(worker_id.clone()))?;
        link.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::Full(worker_id.clone()),
            TrySendError::Closed(_) => LinkError::Closed(worker_id.clone()),
        })
    }

    fn disconnect(&self, worker_id: &WorkerId, conn_id: ConnectionId) {
        let mut links = self.lock();
        match links.get(worker_id) {
            Some(link) if link.conn_id == conn_id => {
                if let Some(link) = links.remove(worker_id) {
                    debug!(worker_id = %worker_id, %conn_id, "Closing worker link");
                    link.cancel.cancel();
                }
            }
            Some(link) => {
                debug!(
                    worker_id = %worker_id,
                    %conn_id,
                    current = %link.conn_id,
                    "Not closing newer worker link"
                );
            }
            None => {}
        }
    }
}

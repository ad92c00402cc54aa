//! Listen queues
//!
//! One bounded queue per lease carries dial notifications from clients to
//! the exporter's Listen stream. Queues are process-local, created lazily
//! by whichever side arrives first, and removed when the lease ends or the
//! Listen stream terminates.

use std::collections::HashMap;
use std::sync::Mutex;

use protocol::messages::ListenResponse;
use tokio::sync::mpsc;

/// Queue depth per lease; a ninth undelivered dial is rejected.
pub const LISTEN_QUEUE_DEPTH: usize = 8;

struct QueueEntry {
    tx: mpsc::Sender<ListenResponse>,
    /// Held until the exporter's Listen stream claims it
    rx: Option<mpsc::Receiver<ListenResponse>>,
}

/// Push rejection reasons.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// Queue holds `LISTEN_QUEUE_DEPTH` undelivered dials
    Full,
    /// Listen stream ended and tore the queue down concurrently
    Closed,
}

/// Process-local map of lease name to dial queue.
#[derive(Default)]
pub struct ListenMap {
    queues: Mutex<HashMap<String, QueueEntry>>,
}

impl ListenMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, lease_name: &str) -> String {
        format!("{namespace}/{lease_name}")
    }

    /// Enqueue a dial notification for the lease.
    pub fn push(
        &self,
        namespace: &str,
        lease_name: &str,
        message: ListenResponse,
    ) -> Result<(), PushError> {
        let mut queues = self.queues.lock().unwrap();
        let entry = queues
            .entry(Self::key(namespace, lease_name))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(LISTEN_QUEUE_DEPTH);
                QueueEntry { tx, rx: Some(rx) }
            });

        entry.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Claim the receive side for a Listen stream. Returns `None` when
    /// another stream already holds it.
    pub fn claim(
        &self,
        namespace: &str,
        lease_name: &str,
    ) -> Option<mpsc::Receiver<ListenResponse>> {
        let mut queues = self.queues.lock().unwrap();
        let entry = queues
            .entry(Self::key(namespace, lease_name))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(LISTEN_QUEUE_DEPTH);
                QueueEntry { tx, rx: Some(rx) }
            });
        entry.rx.take()
    }

    /// Drop the queue; queued dials are discarded and clients re-dial.
    pub fn remove(&self, namespace: &str, lease_name: &str) {
        self.queues
            .lock()
            .unwrap()
            .remove(&Self::key(namespace, lease_name));
    }

    /// Number of live queues, bounded by the number of active leases.
    pub fn len(&self) -> usize {
        self.queues.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(endpoint: &str) -> ListenResponse {
        ListenResponse {
            router_endpoint: endpoint.to_string(),
            router_token: "ticket".to_string(),
        }
    }

    #[tokio::test]
    async fn test_push_then_claim_delivers() {
        let map = ListenMap::new();
        map.push("default", "lease1", message("router:8083")).unwrap();

        let mut rx = map.claim("default", "lease1").unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.router_endpoint, "router:8083");
    }

    #[tokio::test]
    async fn test_claim_then_push_delivers() {
        let map = ListenMap::new();
        let mut rx = map.claim("default", "lease1").unwrap();

        map.push("default", "lease1", message("router:8083")).unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let map = ListenMap::new();
        for _ in 0..LISTEN_QUEUE_DEPTH {
            map.push("default", "lease1", message("router:8083")).unwrap();
        }
        assert_eq!(
            map.push("default", "lease1", message("router:8083")),
            Err(PushError::Full)
        );
    }

    #[test]
    fn test_second_claim_denied() {
        let map = ListenMap::new();
        let _rx = map.claim("default", "lease1").unwrap();
        assert!(map.claim("default", "lease1").is_none());
    }

    #[test]
    fn test_remove_frees_queue() {
        let map = ListenMap::new();
        let _rx = map.claim("default", "lease1").unwrap();
        map.remove("default", "lease1");
        assert!(map.is_empty());
        // A fresh queue can be established afterwards
        assert!(map.claim("default", "lease1").is_some());
    }

    #[test]
    fn test_queues_are_per_lease() {
        let map = ListenMap::new();
        map.push("default", "lease1", message("a")).unwrap();
        map.push("default", "lease2", message("b")).unwrap();
        assert_eq!(map.len(), 2);

        let mut rx = map.claim("default", "lease2").unwrap();
        assert_eq!(rx.try_recv().unwrap().router_endpoint, "b");
    }
}

//! Channel plumbing shared by every transport adapter.
//!
//! The session-facing half queues outbound envelopes and awaits inbound
//! ones; the worker half is moved into the medium task(s). Dedup by msg_id
//! happens on the worker side, before an envelope enters the inbound queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use clipssh_protocol::{DedupWindow, Envelope};

use crate::{Result, TransportError, DRAIN_DEADLINE, QUEUE_CAPACITY};

/// Session-facing half of a transport adapter.
pub struct TransportChannels {
    outbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    shutdown_tx: watch::Sender<bool>,
    broken: Arc<Mutex<Option<String>>>,
}

/// Worker-facing half, moved into the medium task.
pub struct WorkerSide {
    pub outbound_rx: mpsc::Receiver<Envelope>,
    pub shutdown_rx: watch::Receiver<bool>,
    inbound_tx: mpsc::Sender<Envelope>,
    broken: Arc<Mutex<Option<String>>>,
    dedup: DedupWindow,
}

pub fn channel_pair() -> (TransportChannels, WorkerSide) {
    let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broken = Arc::new(Mutex::new(None));

    (
        TransportChannels {
            outbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            shutdown_tx,
            broken: broken.clone(),
        },
        WorkerSide {
            outbound_rx,
            shutdown_rx,
            inbound_tx,
            broken,
            dedup: DedupWindow::default(),
        },
    )
}

impl TransportChannels {
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if let Some(reason) = self.broken_reason() {
            return Err(TransportError::Broken(reason));
        }
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| match self.broken_reason() {
                Some(reason) => TransportError::Broken(reason),
                None => TransportError::Closed,
            })
    }

    pub async fn recv(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let mut inbound = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => match self.broken_reason() {
                Some(reason) => Err(TransportError::Broken(reason)),
                None => Err(TransportError::Closed),
            },
        }
    }

    /// Signal shutdown and wait (bounded) for the worker to drain and exit.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(DRAIN_DEADLINE, self.shutdown_tx.closed()).await;
    }

    fn broken_reason(&self) -> Option<String> {
        self.broken.lock().ok().and_then(|guard| guard.clone())
    }
}

impl WorkerSide {
    /// Record the reason the medium died; subsequent send/recv on the
    /// session side surface it.
    pub fn mark_broken(&self, reason: impl Into<String>) {
        if let Ok(mut guard) = self.broken.lock() {
            guard.get_or_insert(reason.into());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Deliver an inbound envelope unless its msg_id was already seen.
    /// Returns false once the session side is gone.
    pub async fn deliver(&mut self, envelope: Envelope) -> bool {
        if !self.dedup.insert(&envelope.msg_id) {
            tracing::trace!(msg_id = %envelope.msg_id, "dropping duplicate envelope");
            return true;
        }
        self.inbound_tx.send(envelope).await.is_ok()
    }

    /// Blocking-thread variant of [`deliver`] for media driven by OS
    /// threads.
    pub fn deliver_blocking(&mut self, envelope: Envelope) -> bool {
        if !self.dedup.insert(&envelope.msg_id) {
            return true;
        }
        self.inbound_tx.blocking_send(envelope).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipssh_protocol::{Body, Protocol, Role};

    fn envelope() -> Envelope {
        Envelope::new(
            Protocol::GitsshV2,
            "11111111-1111-1111-1111-111111111111",
            Role::Client,
            0,
            Body::Disconnect {},
        )
    }

    #[tokio::test]
    async fn envelopes_flow_worker_to_session_once() {
        let (session, mut worker) = channel_pair();
        let envelope = envelope();

        assert!(worker.deliver(envelope.clone()).await);
        // Same msg_id again: swallowed.
        assert!(worker.deliver(envelope.clone()).await);

        let got = session.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got, Some(envelope));
        let nothing = session.recv(Duration::from_millis(20)).await.unwrap();
        assert_eq!(nothing, None);
    }

    #[tokio::test]
    async fn broken_worker_surfaces_the_reason() {
        let (session, worker) = channel_pair();
        worker.mark_broken("serial fd EIO");
        drop(worker);

        match session.recv(Duration::from_millis(50)).await {
            Err(TransportError::Broken(reason)) => assert!(reason.contains("EIO")),
            other => panic!("expected broken, got {other:?}"),
        }
        assert!(session.send(envelope()).await.is_err());
    }

    #[tokio::test]
    async fn close_returns_once_the_worker_exits() {
        let (session, worker) = channel_pair();
        let mut shutdown_rx = worker.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let _worker = worker;
            let _ = shutdown_rx.changed().await;
        });
        session.close().await;
        handle.await.unwrap();
    }
}

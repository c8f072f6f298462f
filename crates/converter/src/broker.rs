//! Rendezvous between progress observers and the controller.
//!
//! Observers never see controller state. They hand the controller a one-shot
//! reply slot through a single-slot request queue and wait for the answer.
//! The controller replies with whatever snapshot it has cached, so the only
//! synchronisation is the pair of channels.

use log::debug;
use tokio::sync::{mpsc, oneshot};
use crate::progress::Progress;

/// Create a connected observer handle and controller endpoint
pub fn progress_broker() -> (ProgressHandle, BrokerEndpoint) {
    // One request in flight at a time; further observers wait for the slot
    let (tx, rx) = mpsc::channel(1);
    (ProgressHandle { requests: tx }, BrokerEndpoint { requests: rx })
}

/// Observer side, cloned into every HTTP handler
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    requests: mpsc::Sender<ProgressRequest>,
}

impl ProgressHandle {
    /// Ask the controller for the latest snapshot.
    ///
    /// Returns the idle snapshot once the controller has closed the broker,
    /// so callers never wait on a controller that is gone.
    pub async fn snapshot(&self) -> Progress {
        let (reply, response) = oneshot::channel();
        if self.requests.send(ProgressRequest { reply }).await.is_err() {
            return Progress::idle();
        }
        response.await.unwrap_or_default()
    }
}

/// A pending request; answering it consumes it
#[derive(Debug)]
pub struct ProgressRequest {
    reply: oneshot::Sender<Progress>,
}

impl ProgressRequest {
    pub fn reply(self, progress: Progress) {
        // The observer may have given up (client disconnected)
        if self.reply.send(progress).is_err() {
            debug!("Progress requester went away before the reply");
        }
    }
}

/// Controller side of the broker
#[derive(Debug)]
pub struct BrokerEndpoint {
    requests: mpsc::Receiver<ProgressRequest>,
}

impl BrokerEndpoint {
    /// Next pending request, or `None` once every handle is dropped
    pub async fn recv(&mut self) -> Option<ProgressRequest> {
        self.requests.recv().await
    }

    /// Refuse new requests and answer every queued one with the idle snapshot.
    /// Returns the number of requests answered.
    pub fn close_and_drain(&mut self) -> usize {
        self.requests.close();
        let mut answered = 0;
        while let Ok(request) = self.requests.try_recv() {
            request.reply(Progress::idle());
            answered += 1;
        }
        answered
    }
}

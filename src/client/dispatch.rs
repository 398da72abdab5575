//! Completion dispatcher: the single thread per connection that applies
//! inbound acknowledgment frames to in-flight invocations, in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::client::{AckWait, InvokeId};
use crate::utils::EntityError;

use bytes::Bytes;

use parking_lot::Mutex;

use tokio::sync::mpsc;

/// Table of in-flight invocations, shared by the connection and its
/// dispatcher. Holding its lock serializes frame application with resends.
pub(crate) type InflightTable = Arc<Mutex<HashMap<InvokeId, Arc<AckWait>>>>;

/// Acknowledgment frame delivered by the receive path of a connection.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum AckFrame {
    /// Message handed to the transport.
    Sent { id: InvokeId },

    /// Server acknowledged receipt of the message.
    Received { id: InvokeId },

    /// Operation completed with the given result or failure.
    Complete {
        id: InvokeId,
        result: Result<Bytes, EntityError>,
    },
}

impl AckFrame {
    /// ID of the invocation this frame is about.
    pub fn id(&self) -> InvokeId {
        match self {
            Self::Sent { id }
            | Self::Received { id }
            | Self::Complete { id, .. } => *id,
        }
    }
}

/// Message consumed by the dispatcher thread.
#[derive(Debug)]
enum DispatchMsg {
    Frame(AckFrame),
    Stop,
}

/// Cloneable handle used by the receive path to feed frames into the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<DispatchMsg>,
}

impl FrameSender {
    /// Queues a frame for the dispatcher. Fails if the dispatcher has been
    /// stopped.
    pub fn send(&self, frame: AckFrame) -> Result<(), EntityError> {
        self.tx
            .send(DispatchMsg::Frame(frame))
            .map_err(|_| EntityError::msg("completion dispatcher stopped"))
    }
}

/// Handle of a running completion dispatcher thread.
#[derive(Debug)]
pub(crate) struct CompletionDispatcher {
    /// Connection name, used as logging prefix.
    name: String,

    tx: mpsc::UnboundedSender<DispatchMsg>,

    /// Join handle of the dispatcher thread.
    handle: Option<JoinHandle<()>>,
}

impl CompletionDispatcher {
    /// Spawns the dispatcher thread applying frames to `inflight`.
    pub(crate) fn spawn(
        name: &str,
        inflight: InflightTable,
    ) -> Result<Self, EntityError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("dispatcher-{}", name))
            .spawn(move || {
                Self::dispatcher_thread(thread_name, inflight, rx)
            })?;

        Ok(CompletionDispatcher {
            name: name.into(),
            tx,
            handle: Some(handle),
        })
    }

    /// Returns a new frame sender feeding this dispatcher.
    pub(crate) fn frame_sender(&self) -> FrameSender {
        FrameSender {
            tx: self.tx.clone(),
        }
    }

    /// Stops the dispatcher after all frames queued so far and waits for the
    /// thread to exit.
    pub(crate) fn stop(&mut self) -> Result<(), EntityError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // a send failure means the thread has already exited
        let _ = self.tx.send(DispatchMsg::Stop);
        if handle.join().is_err() {
            return logged_err!(self.name; "dispatcher thread panicked");
        }
        Ok(())
    }

    /// Applies one frame to its invocation, if still in flight.
    fn apply(name: &str, inflight: &InflightTable, frame: AckFrame) {
        let mut table = inflight.lock();
        let id = frame.id();
        match frame {
            AckFrame::Sent { .. } => {
                if let Some(wait) = table.get(&id) {
                    wait.sent();
                    return;
                }
            }
            AckFrame::Received { .. } => {
                if let Some(wait) = table.get(&id) {
                    wait.handle_ack();
                    return;
                }
            }
            AckFrame::Complete { result, .. } => {
                if let Some(wait) = table.remove(&id) {
                    wait.handle_complete(result);
                    return;
                }
            }
        }
        pf_warn!(name; "frame for unknown invocation {} ignored", id);
    }

    /// Dispatcher thread function.
    fn dispatcher_thread(
        name: String,
        inflight: InflightTable,
        mut rx: mpsc::UnboundedReceiver<DispatchMsg>,
    ) {
        pf_debug!(name; "dispatcher thread spawned");

        while let Some(msg) = rx.blocking_recv() {
            match msg {
                DispatchMsg::Frame(frame) => {
                    pf_trace!(name; "dispatch {:?}", frame);
                    Self::apply(&name, &inflight, frame);
                }
                DispatchMsg::Stop => break,
            }
        }

        pf_debug!(name; "dispatcher thread exitted");
    }
}

//! Client connection issuing entity invocations and surviving failovers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::client::dispatch::{CompletionDispatcher, InflightTable};
use crate::client::{
    AckRequirements, AckWait, FrameSender, InvokeFuture, InvokeId,
};
use crate::common::StateDumpCollector;
use crate::utils::EntityError;

use bytes::Bytes;

use parking_lot::Mutex;

use serde::Deserialize;

/// Outbound side of a transport to one server.
pub trait FrameSink: Send {
    /// Transmits the raw message of an invocation.
    fn transmit(
        &mut self,
        id: InvokeId,
        payload: Bytes,
    ) -> Result<(), EntityError>;
}

/// Configuration parameters struct.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Connection name, used as logging prefix.
    pub name: String,

    /// Maximum number of in-flight invocations; 0 means unlimited.
    pub max_inflight: usize,

    /// Whether to retransmit in-flight invocations on failover.
    pub resend_on_failover: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            name: "conn".into(),
            max_inflight: 0,
            resend_on_failover: true,
        }
    }
}

/// Client connection to a server-resident entity.
///
/// Invocations are tracked in an in-flight table until their completion
/// frame arrives. The table lock is taken by the dispatcher while applying a
/// frame and by `failover()` while re-arming and retransmitting, so the two
/// never interleave for the same invocation. Lock order is table -> sink.
pub struct ClientConnection {
    config: ConnectionConfig,

    /// Next invocation ID to assign.
    next_id: AtomicU64,

    /// In-flight invocations, shared with the dispatcher thread.
    inflight: InflightTable,

    /// Current outbound transport.
    sink: Mutex<Box<dyn FrameSink>>,

    /// Number of failovers so far.
    failovers: AtomicU64,

    /// Set once `shutdown()` begins; no invocation is accepted after.
    closed: AtomicBool,

    dispatcher: Mutex<CompletionDispatcher>,
}

impl ClientConnection {
    /// Creates a new connection over the given sink and spawns its
    /// completion dispatcher thread.
    pub fn new_and_setup(
        sink: Box<dyn FrameSink>,
        config_str: Option<&str>,
    ) -> Result<Self, EntityError> {
        let config = parsed_config!(config_str => ConnectionConfig;
            name, max_inflight, resend_on_failover
        )?;
        if config.name.is_empty() {
            return logged_err!("conn"; "invalid empty connection name");
        }

        let inflight: InflightTable = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher =
            CompletionDispatcher::spawn(&config.name, inflight.clone())?;
        pf_info!(config.name; "connection set up");

        Ok(ClientConnection {
            config,
            next_id: AtomicU64::new(0),
            inflight,
            sink: Mutex::new(sink),
            failovers: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(dispatcher),
        })
    }

    /// Gets the connection name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns a sender for the receive path to feed acknowledgment frames.
    pub fn frame_sender(&self) -> FrameSender {
        self.dispatcher.lock().frame_sender()
    }

    /// Number of invocations currently in flight.
    pub fn num_inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Issues an invocation carrying `payload`, returning its future. The
    /// payload is saved for retransmission on failover. The invocation is
    /// marked sent before any frame from the server can be applied to it.
    pub fn invoke(
        &self,
        payload: Bytes,
        requirements: AckRequirements,
    ) -> Result<Arc<AckWait>, EntityError> {
        let mut table = self.inflight.lock();
        if self.closed.load(Ordering::Acquire) {
            return logged_err!(self.config.name; "connection already closed");
        }
        if self.config.max_inflight > 0
            && table.len() >= self.config.max_inflight
        {
            return logged_err!(
                self.config.name;
                "too many in-flight invocations: {}",
                table.len()
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wait = Arc::new(AckWait::new(id, requirements));
        wait.save_raw_message_for_resend(payload.clone());
        table.insert(id, wait.clone());

        if let Err(e) = self.sink.lock().transmit(id, payload) {
            table.remove(&id);
            return logged_err!(
                self.config.name;
                "error transmitting invocation {}: {}",
                id,
                e
            );
        }
        // still holding the table lock, so the dispatcher sees it sent
        wait.sent();

        pf_trace!(self.config.name; "invoked {} {}", id, requirements);
        Ok(wait)
    }

    /// Switches to a new transport after the current one failed. Unless
    /// disabled in config, every in-flight invocation is re-armed and its
    /// saved message retransmitted over the new sink; callers blocked on
    /// those invocations keep waiting for the new completions. Returns the
    /// number of retransmitted invocations.
    ///
    /// A transmit failure does not stop the pass. Invocations that failed to
    /// go out stay in flight, re-armed and still holding their saved
    /// message, so a later failover resends them; the error names their IDs.
    pub fn failover(
        &self,
        new_sink: Box<dyn FrameSink>,
    ) -> Result<usize, EntityError> {
        let table = self.inflight.lock();
        let mut sink = self.sink.lock();
        *sink = new_sink;
        let round = self.failovers.fetch_add(1, Ordering::Relaxed) + 1;
        pf_info!(
            self.config.name;
            "failover #{} with {} in flight",
            round,
            table.len()
        );
        if !self.config.resend_on_failover {
            return Ok(0);
        }

        let mut ids: Vec<InvokeId> = table.keys().copied().collect();
        ids.sort_unstable();
        let mut resent = 0;
        let mut failed = vec![];
        for id in ids {
            let wait = &table[&id];
            if wait.is_done() {
                continue;
            }
            let Some(raw) = wait.reset_and_get_message_for_resend() else {
                pf_warn!(self.config.name; "no message saved for {}", id);
                continue;
            };
            match sink.transmit(id, raw) {
                Ok(()) => {
                    pf_debug!(self.config.name; "resent invocation {}", id);
                    resent += 1;
                }
                Err(e) => {
                    pf_warn!(self.config.name; "error resending {}: {}", id, e);
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            return logged_err!(
                self.config.name;
                "failover #{} resent {}, failed to resend {:?}",
                round,
                resent,
                failed
            );
        }
        Ok(resent)
    }

    /// Stops the dispatcher after all frames queued so far. Invocations still
    /// in flight then complete with a "connection closed" failure.
    pub fn shutdown(&self) -> Result<(), EntityError> {
        self.closed.store(true, Ordering::Release);
        self.dispatcher.lock().stop()?;

        let mut table = self.inflight.lock();
        for (id, wait) in table.drain() {
            pf_debug!(self.config.name; "failing pending invocation {}", id);
            wait.handle_complete(Err(EntityError::msg("connection closed")));
        }
        pf_info!(self.config.name; "connection shut down");
        Ok(())
    }

    /// Dumps connection state, including every in-flight invocation.
    pub fn add_state_to(
        &self,
        collector: &dyn StateDumpCollector,
    ) -> Result<(), EntityError> {
        collector.add_state("name", &self.config.name);
        collector.add_state(
            "failovers",
            &self.failovers.load(Ordering::Relaxed).to_string(),
        );
        collector.add_state(
            "next_id",
            &self.next_id.load(Ordering::Relaxed).to_string(),
        );

        let table = self.inflight.lock();
        let mut ids: Vec<InvokeId> = table.keys().copied().collect();
        ids.sort_unstable();
        let ids_json = serde_json::to_string(&ids)?;
        collector.add_state_json("inflight_ids", &ids_json)?;
        let inflight = collector.sub_state_collector("inflight")?;
        for (id, wait) in table.iter() {
            let sub = inflight.sub_state_collector(&id.to_string())?;
            wait.add_state_to(sub.as_ref())?;
        }
        Ok(())
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Err(e) = self.dispatcher.get_mut().stop() {
            pf_error!(self.config.name; "error stopping dispatcher: {}", e);
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("config", &self.config)
            .field("inflight", &self.num_inflight())
            .finish()
    }
}

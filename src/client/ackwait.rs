//! Per-invocation acknowledgment tracking future.
//!
//! An `AckWait` follows one invocation through its phases: sent by the
//! client, received by the server, and completed. Transitions are applied by
//! the connection's completion dispatcher thread; the caller thread blocks in
//! `get()` until completion. After a failover, the connection re-arms the
//! wait and retransmits the saved payload, and the same blocked caller is
//! released by the completion of the resent attempt.

use std::fmt;

use crate::client::{InvokeError, InvokeFuture};
use crate::common::StateDumpCollector;
use crate::utils::EntityError;

use bytes::Bytes;

use parking_lot::{Condvar, Mutex};

use tokio::time::Duration;

/// Invocation ID type, unique within a connection.
pub type InvokeId = u64;

/// Which phases of delivery a caller wants to wait for.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct AckRequirements {
    /// Wait for the message to be handed to the transport.
    pub sent: bool,

    /// Wait for the server's receive acknowledgment.
    pub received: bool,

    /// Wait for the operation's completion.
    pub completed: bool,
}

impl AckRequirements {
    /// Creates a requirements set from the three phase flags.
    pub fn new(sent: bool, received: bool, completed: bool) -> Self {
        AckRequirements {
            sent,
            received,
            completed,
        }
    }

    /// Requires every phase.
    pub fn all() -> Self {
        Self::new(true, true, true)
    }
}

impl fmt::Display for AckRequirements {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "sent={} received={} completed={}",
            self.sent, self.received, self.completed
        )
    }
}

/// Current phase of an invocation within its send cycle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AckPhase {
    AwaitingSent,
    AwaitingReceived,
    AwaitingComplete,
    Done,
}

/// Outcome slot. Holding the result and the error in one enum keeps them
/// mutually exclusive.
#[derive(Debug, PartialEq, Eq, Clone)]
enum Outcome {
    Pending,
    Done(Result<Bytes, EntityError>),
}

/// Mutable phase state of one send cycle.
#[derive(Debug, PartialEq, Eq, Clone)]
struct PhaseState {
    awaiting_sent: bool,
    awaiting_received: bool,
    awaiting_completed: bool,
    outcome: Outcome,
}

impl PhaseState {
    /// Fresh state of a first send cycle.
    fn armed(req: &AckRequirements) -> Self {
        PhaseState {
            awaiting_sent: req.sent,
            awaiting_received: req.received,
            awaiting_completed: req.completed,
            outcome: Outcome::Pending,
        }
    }

    /// State of a resend cycle. Retransmission counts as sent again, so
    /// only the receive and complete requirements are re-armed.
    fn rearmed(self, req: &AckRequirements) -> Self {
        PhaseState {
            awaiting_received: req.received,
            awaiting_completed: req.completed,
            outcome: Outcome::Pending,
            ..self
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.outcome, Outcome::Done(_))
    }

    fn acked(&self) -> bool {
        !(self.awaiting_sent
            || self.awaiting_received
            || self.awaiting_completed)
    }

    fn phase(&self) -> AckPhase {
        if self.is_terminal() {
            AckPhase::Done
        } else if self.awaiting_sent {
            AckPhase::AwaitingSent
        } else if self.awaiting_received {
            AckPhase::AwaitingReceived
        } else {
            AckPhase::AwaitingComplete
        }
    }
}

/// Fields guarded by the per-invocation lock.
#[derive(Debug)]
struct AckWaitInner {
    state: PhaseState,

    /// Raw message saved for retransmission.
    raw_message: Option<Bytes>,

    /// Number of resend cycles so far.
    resends: u64,
}

/// Acknowledgment-tracking future of a single invocation.
#[derive(Debug)]
pub struct AckWait {
    /// Invocation ID.
    id: InvokeId,

    /// Requirements fixed at creation, used to re-arm on resend.
    requirements: AckRequirements,

    inner: Mutex<AckWaitInner>,

    /// Signalled on every transition.
    cond: Condvar,
}

impl AckWait {
    /// Creates a new future waiting for the given phases.
    pub fn new(id: InvokeId, requirements: AckRequirements) -> Self {
        AckWait {
            id,
            requirements,
            inner: Mutex::new(AckWaitInner {
                state: PhaseState::armed(&requirements),
                raw_message: None,
                resends: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Gets the invocation ID.
    pub fn id(&self) -> InvokeId {
        self.id
    }

    /// Gets the requirements this future was created with.
    pub fn requirements(&self) -> AckRequirements {
        self.requirements
    }

    /// Snapshot of the current phase.
    pub fn phase(&self) -> AckPhase {
        self.inner.lock().state.phase()
    }

    /// Marks the message as handed to the transport.
    pub fn sent(&self) {
        let mut inner = self.inner.lock();
        inner.state.awaiting_sent = false;
        pf_trace!(self.id; "sent");
        self.cond.notify_all();
    }

    /// Handles the server's receive acknowledgment.
    pub fn handle_ack(&self) {
        let mut inner = self.inner.lock();
        inner.state.awaiting_received = false;
        pf_trace!(self.id; "received");
        self.cond.notify_all();
    }

    /// Handles the completion of the invocation, storing its outcome. A
    /// second completion within the same send cycle is dropped.
    pub fn handle_complete(&self, result: Result<Bytes, EntityError>) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            pf_warn!(self.id; "duplicate completion ignored");
            return;
        }
        pf_trace!(self.id; "completed ok={}", result.is_ok());
        inner.state.awaiting_completed = false;
        inner.state.outcome = Outcome::Done(result);
        self.cond.notify_all();
    }

    /// Blocks until every required phase has been acknowledged.
    pub fn wait_for_ack(&self) {
        let mut inner = self.inner.lock();
        while !inner.state.acked() {
            self.cond.wait(&mut inner);
        }
    }

    /// Records the raw message to retransmit on resend. Called once per
    /// physical send attempt.
    pub fn save_raw_message_for_resend(&self, raw: Bytes) {
        self.inner.lock().raw_message = Some(raw);
    }

    /// Re-arms the receive and complete waits to their configured
    /// requirements, clears any outcome, and returns the saved raw message
    /// for the caller to retransmit. Threads blocked in `get()` keep waiting
    /// and are released by the completion of the resent message.
    ///
    /// Must not race with `handle_complete()` of the same invocation; the
    /// connection layer serializes the two.
    pub fn reset_and_get_message_for_resend(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.state = inner.state.clone().rearmed(&self.requirements);
        inner.resends += 1;
        pf_debug!(self.id; "re-armed for resend #{}", inner.resends);
        self.cond.notify_all();
        inner.raw_message.clone()
    }

    /// Number of resend cycles this invocation went through.
    pub fn resends(&self) -> u64 {
        self.inner.lock().resends
    }

    /// Dumps this invocation's state into the given collector.
    pub fn add_state_to(
        &self,
        collector: &dyn StateDumpCollector,
    ) -> Result<(), EntityError> {
        let inner = self.inner.lock();
        collector.add_state("phase", &format!("{:?}", inner.state.phase()));
        collector.add_state("requirements", &self.requirements.to_string());
        collector.add_state("resends", &inner.resends.to_string());
        collector.add_state(
            "resend_message_saved",
            &inner.raw_message.is_some().to_string(),
        );
        if let Outcome::Done(Err(ref e)) = inner.state.outcome {
            collector.add_state("error", &e.to_string());
        }
        Ok(())
    }
}

impl InvokeFuture<Bytes> for AckWait {
    fn is_done(&self) -> bool {
        self.inner.lock().state.is_terminal()
    }

    fn get(&self) -> Result<Bytes, InvokeError> {
        let mut inner = self.inner.lock();
        loop {
            if let Outcome::Done(ref result) = inner.state.outcome {
                return result.clone().map_err(InvokeError::Failed);
            }
            self.cond.wait(&mut inner);
        }
    }

    fn get_with_timeout(
        &self,
        _timeout: Duration,
    ) -> Result<Bytes, InvokeError> {
        Err(InvokeError::Unsupported("get_with_timeout"))
    }

    fn interrupt(&self) -> Result<(), InvokeError> {
        Err(InvokeError::Unsupported("interrupt"))
    }
}

#[cfg(test)]
mod ackwait_tests {
    use super::*;
    use crate::common::StateTree;
    use std::sync::Arc;
    use std::thread;

    fn new_wait(
        id: InvokeId,
        sent: bool,
        received: bool,
        completed: bool,
    ) -> Arc<AckWait> {
        Arc::new(AckWait::new(
            id,
            AckRequirements::new(sent, received, completed),
        ))
    }

    fn spawn_getter(
        wait: &Arc<AckWait>,
    ) -> thread::JoinHandle<Result<Bytes, InvokeError>> {
        let wait = wait.clone();
        thread::spawn(move || wait.get())
    }

    #[test]
    fn complete_then_get() {
        let wait = AckWait::new(0, AckRequirements::new(false, false, true));
        assert!(!wait.is_done());
        wait.handle_complete(Ok(Bytes::from_static(b"payload")));
        assert!(wait.is_done());
        assert_eq!(wait.get(), Ok(Bytes::from_static(b"payload")));
        // repeated calls yield the same outcome
        assert_eq!(wait.get(), Ok(Bytes::from_static(b"payload")));
        assert!(wait.is_done());
    }

    #[test]
    fn complete_with_error() {
        let wait = AckWait::new(1, AckRequirements::new(false, false, true));
        let err = EntityError::msg("ErrX");
        wait.handle_complete(Err(err.clone()));
        assert!(wait.is_done());
        assert_eq!(wait.get(), Err(InvokeError::Failed(err.clone())));
        assert_eq!(wait.get(), Err(InvokeError::Failed(err)));
    }

    #[test]
    fn blocks_until_complete() {
        let wait = new_wait(2, false, true, true);
        wait.sent();
        wait.handle_ack();
        let getter = spawn_getter(&wait);
        thread::sleep(Duration::from_millis(100));
        assert!(!getter.is_finished());
        assert!(!wait.is_done());
        wait.handle_complete(Ok(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(
            getter.join().unwrap(),
            Ok(Bytes::from_static(&[1, 2, 3]))
        );
    }

    #[test]
    fn done_visible_across_threads() {
        let wait = Arc::new(AckWait::new(3, AckRequirements::all()));
        let wait_ref = wait.clone();
        let completer = thread::spawn(move || {
            wait_ref.handle_complete(Ok(Bytes::new()));
        });
        completer.join().unwrap();
        assert!(wait.is_done());
    }

    #[test]
    fn error_to_blocked_caller() {
        let wait = new_wait(4, false, false, true);
        let getter = spawn_getter(&wait);
        thread::sleep(Duration::from_millis(50));
        wait.handle_complete(Err(EntityError::msg("ErrX")));
        assert_eq!(
            getter.join().unwrap(),
            Err(InvokeError::Failed(EntityError::msg("ErrX")))
        );
    }

    #[test]
    fn resend_rearms_and_releases_same_caller() {
        let wait = new_wait(5, false, true, true);
        wait.sent();
        wait.handle_ack();
        wait.handle_complete(Ok(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(wait.get(), Ok(Bytes::from_static(&[1, 2, 3])));

        let raw = Bytes::from_static(b"raw invoke message");
        wait.save_raw_message_for_resend(raw.clone());
        assert_eq!(wait.reset_and_get_message_for_resend(), Some(raw));
        assert!(!wait.is_done());
        assert_eq!(wait.phase(), AckPhase::AwaitingReceived);

        let getter = spawn_getter(&wait);
        thread::sleep(Duration::from_millis(50));
        assert!(!getter.is_finished());
        wait.handle_complete(Ok(Bytes::from_static(&[4, 5, 6])));
        assert_eq!(
            getter.join().unwrap(),
            Ok(Bytes::from_static(&[4, 5, 6]))
        );
    }

    #[test]
    fn caller_parked_across_failover() {
        let wait = Arc::new(AckWait::new(6, AckRequirements::all()));
        wait.save_raw_message_for_resend(Bytes::from_static(b"msg"));
        let getter = spawn_getter(&wait);
        wait.sent();
        // connection to the first server breaks before completion
        let resent = wait.reset_and_get_message_for_resend();
        assert_eq!(resent, Some(Bytes::from_static(b"msg")));
        thread::sleep(Duration::from_millis(50));
        assert!(!getter.is_finished());
        wait.handle_ack();
        wait.handle_complete(Ok(Bytes::from_static(b"from new server")));
        assert_eq!(
            getter.join().unwrap(),
            Ok(Bytes::from_static(b"from new server"))
        );
    }

    #[test]
    fn resend_repeatable() {
        let req = AckRequirements::new(true, true, false);
        let wait = AckWait::new(7, req);
        for round in 0..3u8 {
            let raw = Bytes::from(vec![round; 4]);
            wait.save_raw_message_for_resend(raw.clone());
            wait.sent();
            wait.handle_ack();
            wait.handle_complete(Ok(Bytes::new()));
            assert_eq!(wait.reset_and_get_message_for_resend(), Some(raw));
            let inner = wait.inner.lock();
            assert!(inner.state.awaiting_received);
            assert!(!inner.state.awaiting_completed);
            assert_eq!(inner.state.outcome, Outcome::Pending);
        }
        assert_eq!(wait.resends(), 3);
    }

    #[test]
    fn resend_without_saved_message() {
        let wait = AckWait::new(8, AckRequirements::all());
        assert_eq!(wait.reset_and_get_message_for_resend(), None);
    }

    #[test]
    fn duplicate_complete_ignored() {
        let wait = AckWait::new(9, AckRequirements::all());
        wait.handle_complete(Ok(Bytes::from_static(b"first")));
        wait.handle_complete(Err(EntityError::msg("late")));
        assert_eq!(wait.get(), Ok(Bytes::from_static(b"first")));
    }

    #[test]
    fn unsupported_ops_fail_fast() {
        let wait = Arc::new(AckWait::new(10, AckRequirements::all()));
        let check = |w: &AckWait| {
            assert_eq!(
                w.get_with_timeout(Duration::from_millis(1)),
                Err(InvokeError::Unsupported("get_with_timeout"))
            );
            assert_eq!(
                w.interrupt(),
                Err(InvokeError::Unsupported("interrupt"))
            );
        };
        check(wait.as_ref());

        // mid-wait
        let getter = spawn_getter(&wait);
        thread::sleep(Duration::from_millis(20));
        check(wait.as_ref());

        wait.handle_complete(Ok(Bytes::new()));
        assert!(getter.join().unwrap().is_ok());
        check(wait.as_ref());
    }

    #[test]
    fn phases_in_order() {
        let wait = AckWait::new(11, AckRequirements::all());
        assert_eq!(wait.phase(), AckPhase::AwaitingSent);
        wait.sent();
        assert_eq!(wait.phase(), AckPhase::AwaitingReceived);
        wait.handle_ack();
        assert_eq!(wait.phase(), AckPhase::AwaitingComplete);
        wait.handle_complete(Ok(Bytes::new()));
        assert_eq!(wait.phase(), AckPhase::Done);

        let skipping = new_wait(12, false, false, true);
        assert_eq!(skipping.phase(), AckPhase::AwaitingComplete);
    }

    #[test]
    fn wait_for_ack_required_phases() {
        let wait = new_wait(13, true, true, false);
        let waiter = {
            let wait = wait.clone();
            thread::spawn(move || wait.wait_for_ack())
        };
        wait.sent();
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        wait.handle_ack();
        waiter.join().unwrap();
        // completion not required, so not done yet
        assert!(!wait.is_done());
    }

    #[test]
    fn dump_state() -> Result<(), EntityError> {
        let wait = AckWait::new(14, AckRequirements::all());
        wait.handle_complete(Err(EntityError::msg("boom")));
        let tree = StateTree::new();
        wait.add_state_to(&tree)?;
        let json = tree.to_json();
        assert_eq!(json["phase"], "Done");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["resends"], "0");
        Ok(())
    }
}

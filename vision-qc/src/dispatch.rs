//! Batch gating and the one-command-in-flight dispatch state machine.
//!
//! `BatchGate` enforces the generation rules (exactly-once ingestion, one
//! pending slot, newest pending wins). `DispatchCore` is the synchronous
//! state machine — testable without sockets — and `run_dispatcher` drives
//! it as a task against the link's channels.
//!
//! A controller `DONE` advances the machine; `IDLE` is informational and
//! never advances it — treating the two alike would permit overtaking.

use std::collections::VecDeque;
use std::time::Duration;

use qc_types::ControllerReply;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::LinkEvent;
use crate::signal::Signal;

/// How long shutdown waits for the in-flight acknowledgment before
/// dropping the rest of the batch.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

// ── Batch gate ────────────────────────────────────────────────────────────────

/// One ingested command batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub generation: u64,
    pub commands: Vec<String>,
}

#[derive(Debug, PartialEq)]
pub enum GateDecision {
    /// Batch starts now.
    Activate(Batch),
    /// A batch is active; stashed into the single pending slot.
    Stashed,
    /// Generation already started; discarded.
    Duplicate,
    /// Batch carried no commands; generation consumed, nothing started.
    Empty,
}

/// Generation bookkeeping: a generation is ingested exactly once, at most
/// one batch is active, and at most one batch is pending (latest wins).
#[derive(Debug, Default)]
pub struct BatchGate {
    last_started: Option<u64>,
    pending: Option<Batch>,
    active: bool,
}

impl BatchGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, batch: Batch) -> GateDecision {
        if self.last_started == Some(batch.generation) {
            return GateDecision::Duplicate;
        }
        if batch.commands.is_empty() {
            self.last_started = Some(batch.generation);
            return GateDecision::Empty;
        }
        if self.active {
            self.pending = Some(batch);
            return GateDecision::Stashed;
        }
        self.active = true;
        self.last_started = Some(batch.generation);
        GateDecision::Activate(batch)
    }

    /// Active batch finished: promote the pending batch, if any.
    pub fn complete(&mut self) -> Option<Batch> {
        self.active = false;
        let next = self.pending.take()?;
        self.active = true;
        self.last_started = Some(next.generation);
        Some(next)
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.active.then_some(self.last_started).flatten()
    }
}

// ── Dispatch state machine ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No batch active; acknowledgments are ignored.
    Idle,
    /// Batch active, ready slot open.
    Armed,
    /// One command sent, awaiting acknowledgment.
    InFlight,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DoneOutcome {
    /// No batch active; extra `DONE` ignored.
    Ignored,
    /// Queue non-empty; ready to send the next command.
    Advance,
    /// Queue drained; batch complete, machine back to idle.
    BatchComplete,
}

/// Synchronous core of the sender. At most one command is in flight; on a
/// send failure the command is re-enqueued at the head (the controller is
/// idempotent for same-position moves, so a possible replay is safe).
#[derive(Debug)]
pub struct DispatchCore {
    queue: VecDeque<String>,
    state: DispatchState,
    ready: bool,
    batch_active: bool,
    in_flight: Option<String>,
}

impl DispatchCore {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            state: DispatchState::Idle,
            ready: false,
            batch_active: false,
            in_flight: None,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Start a batch. Only legal from `Idle`; the batch gate guarantees it.
    pub fn activate_batch(&mut self, commands: Vec<String>) {
        debug_assert_eq!(self.state, DispatchState::Idle);
        self.queue = commands.into();
        self.batch_active = true;
        self.ready = true;
        self.state = DispatchState::Armed;
    }

    /// Take the next command to send, if the machine and the link allow it.
    pub fn poll_send(&mut self, connected: bool) -> Option<String> {
        if !connected || !self.batch_active || !self.ready || self.state == DispatchState::InFlight
        {
            return None;
        }
        let cmd = self.queue.pop_front()?;
        self.in_flight = Some(cmd.clone());
        self.ready = false;
        self.state = DispatchState::InFlight;
        Some(cmd)
    }

    /// Controller acknowledged the in-flight command.
    pub fn on_done(&mut self) -> DoneOutcome {
        if !self.batch_active {
            return DoneOutcome::Ignored;
        }
        self.in_flight = None;
        if self.queue.is_empty() {
            self.batch_active = false;
            self.ready = false;
            self.state = DispatchState::Idle;
            DoneOutcome::BatchComplete
        } else {
            self.ready = true;
            self.state = DispatchState::Armed;
            DoneOutcome::Advance
        }
    }

    /// Heartbeat; informational only.
    pub fn on_idle(&self) {}

    /// Link dropped. The unacknowledged command goes back to the head of
    /// the queue; sending resumes once the link reports connected again.
    pub fn on_disconnect(&mut self) {
        if let Some(cmd) = self.in_flight.take() {
            self.queue.push_front(cmd);
            self.ready = true;
            self.state = DispatchState::Armed;
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state == DispatchState::InFlight
    }
}

impl Default for DispatchCore {
    fn default() -> Self {
        Self::new()
    }
}

// ── Dispatcher task ───────────────────────────────────────────────────────────

/// Drive the state machine against the link. Batches arrive on `batch_rx`,
/// bytes leave through `link_tx`, link/controller events arrive on
/// `link_events`, and every completed batch generation is reported on
/// `complete_tx`.
pub async fn run_dispatcher(
    mut batch_rx: mpsc::Receiver<Batch>,
    link_tx: mpsc::Sender<Vec<u8>>,
    mut link_events: mpsc::Receiver<LinkEvent>,
    mut stop: Signal,
    complete_tx: mpsc::Sender<u64>,
) {
    let mut gate = BatchGate::new();
    let mut core = DispatchCore::new();
    let mut connected = false;

    info!("dispatcher started");
    'outer: loop {
        while let Some(cmd) = core.poll_send(connected) {
            debug!(command = %cmd, "sending");
            let mut bytes = cmd.into_bytes();
            bytes.push(b'\n');
            if link_tx.send(bytes).await.is_err() {
                warn!("link channel closed while sending");
                core.on_disconnect();
                connected = false;
                break 'outer;
            }
        }

        tokio::select! {
            _ = stop.wait_set() => break 'outer,

            batch = batch_rx.recv() => {
                let Some(batch) = batch else { break 'outer };
                let generation = batch.generation;
                match gate.offer(batch) {
                    GateDecision::Activate(b) => {
                        info!(generation, commands = b.commands.len(), "batch activated");
                        core.activate_batch(b.commands);
                    }
                    GateDecision::Stashed => {
                        info!(generation, "batch stashed while another is active");
                    }
                    GateDecision::Duplicate => debug!(generation, "duplicate generation discarded"),
                    GateDecision::Empty => info!(generation, "empty batch; nothing to dispatch"),
                }
            }

            event = link_events.recv() => {
                let Some(event) = event else { break 'outer };
                match event {
                    LinkEvent::Connected => {
                        connected = true;
                    }
                    LinkEvent::Disconnected => {
                        connected = false;
                        core.on_disconnect();
                    }
                    LinkEvent::Reply(ControllerReply::Done) => match core.on_done() {
                        DoneOutcome::Ignored => debug!("DONE with no batch active; ignored"),
                        DoneOutcome::Advance => {}
                        DoneOutcome::BatchComplete => {
                            if let Some(generation) = gate.active_generation() {
                                let _ = complete_tx.send(generation).await;
                            }
                            info!("batch complete");
                            if let Some(next) = gate.complete() {
                                info!(generation = next.generation, "promoting pending batch");
                                core.activate_batch(next.commands);
                            }
                        }
                    },
                    LinkEvent::Reply(ControllerReply::Idle) => {
                        core.on_idle();
                        debug!("controller idle");
                    }
                    LinkEvent::Reply(ControllerReply::Other) => {}
                }
            }
        }
    }

    // bounded drain: give the in-flight command a chance to be acknowledged
    if core.is_in_flight() {
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while let Some(event) = link_events.recv().await {
                if matches!(event, LinkEvent::Reply(ControllerReply::Done)) {
                    break;
                }
            }
        })
        .await;
    }
    info!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(generation: u64, commands: &[&str]) -> Batch {
        Batch { generation, commands: commands.iter().map(|s| s.to_string()).collect() }
    }

    #[test]
    fn gate_rejects_duplicate_generation() {
        let mut gate = BatchGate::new();
        assert!(matches!(gate.offer(batch(100, &["a"])), GateDecision::Activate(_)));
        assert_eq!(gate.offer(batch(100, &["a"])), GateDecision::Duplicate);
    }

    #[test]
    fn gate_keeps_exactly_one_pending_and_latest_wins() {
        let mut gate = BatchGate::new();
        assert!(matches!(gate.offer(batch(1, &["a"])), GateDecision::Activate(_)));
        assert_eq!(gate.offer(batch(2, &["b"])), GateDecision::Stashed);
        assert_eq!(gate.offer(batch(3, &["c"])), GateDecision::Stashed);

        let promoted = gate.complete().unwrap();
        assert_eq!(promoted.generation, 3);
        assert_eq!(promoted.commands, vec!["c".to_string()]);
        // nothing left pending
        assert!(gate.complete().is_none());
    }

    #[test]
    fn gate_consumes_empty_generations() {
        let mut gate = BatchGate::new();
        assert_eq!(gate.offer(batch(5, &[])), GateDecision::Empty);
        assert_eq!(gate.offer(batch(5, &["a"])), GateDecision::Duplicate);
        assert!(matches!(gate.offer(batch(6, &["a"])), GateDecision::Activate(_)));
    }

    #[test]
    fn core_preserves_order_and_multiset() {
        let mut core = DispatchCore::new();
        core.activate_batch(vec!["a".into(), "b".into(), "c".into()]);

        let mut sent = Vec::new();
        loop {
            match core.poll_send(true) {
                Some(cmd) => {
                    // strictly one in flight
                    assert_eq!(core.poll_send(true), None);
                    sent.push(cmd);
                }
                None => break,
            }
            match core.on_done() {
                DoneOutcome::Advance => {}
                DoneOutcome::BatchComplete => break,
                DoneOutcome::Ignored => panic!("batch should be active"),
            }
        }
        assert_eq!(sent, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(core.state(), DispatchState::Idle);
    }

    #[test]
    fn done_without_batch_is_ignored() {
        let mut core = DispatchCore::new();
        assert_eq!(core.on_done(), DoneOutcome::Ignored);
        assert_eq!(core.state(), DispatchState::Idle);
    }

    #[test]
    fn disconnect_requeues_in_flight_at_head() {
        let mut core = DispatchCore::new();
        core.activate_batch(vec!["a".into(), "b".into(), "c".into()]);

        assert_eq!(core.poll_send(true).unwrap(), "a");
        assert_eq!(core.on_done(), DoneOutcome::Advance);
        assert_eq!(core.poll_send(true).unwrap(), "b");
        assert_eq!(core.on_done(), DoneOutcome::Advance);

        // third command goes out, link drops before the ack
        assert_eq!(core.poll_send(true).unwrap(), "c");
        core.on_disconnect();
        assert_eq!(core.queue_len(), 1);
        // no sends while disconnected
        assert_eq!(core.poll_send(false), None);
        // after reconnect the same command goes first
        assert_eq!(core.poll_send(true).unwrap(), "c");
        assert_eq!(core.on_done(), DoneOutcome::BatchComplete);
    }

    #[test]
    fn disconnect_while_armed_changes_nothing() {
        let mut core = DispatchCore::new();
        core.activate_batch(vec!["a".into()]);
        core.on_disconnect();
        assert_eq!(core.queue_len(), 1);
        assert_eq!(core.poll_send(true).unwrap(), "a");
    }

    #[test]
    fn idle_never_advances_the_machine() {
        let mut core = DispatchCore::new();
        core.activate_batch(vec!["a".into(), "b".into()]);
        assert_eq!(core.poll_send(true).unwrap(), "a");
        core.on_idle();
        // still awaiting the DONE; nothing further may be sent
        assert_eq!(core.poll_send(true), None);
        assert!(core.is_in_flight());
    }
}

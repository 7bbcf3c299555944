//! Per-match scheduler.
//!
//! Each match runs on its own OS thread so a slow handler only stalls its own
//! ticks. Membership commands are applied as they arrive; at every tick
//! deadline the core's loop runs and deferred broadcasts are flushed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::context::JoinCandidate;
use crate::core::{JoinAttemptOutcome, MatchCore, MatchLabel};
use crate::envelope::{DeferredMessage, Envelope};
use crate::error::{MatchError, Result};
use crate::presence::{Presence, PresenceDirectory};
use crate::queue::InboundSender;
use crate::router::{DeferFn, MessageRouter};

#[cfg(feature = "metrics")]
use crate::metrics::MatchMetrics;

/// Message sent to clients when their match is torn down by an error.
pub const MATCH_ERROR_MESSAGE: &str = "Match encountered an error";

enum MatchCommand {
    JoinAttempt {
        candidate: JoinCandidate,
        metadata: Value,
        reply: Sender<Result<JoinAttemptOutcome>>,
    },
    Join(Vec<Presence>),
    Leave(Vec<Presence>),
    Stop { grace_seconds: i64 },
}

/// Handle to a running match thread.
pub struct MatchHandle {
    match_id: String,
    tick_rate: u32,
    commands: Sender<MatchCommand>,
    inbound: InboundSender,
    label: MatchLabel,
    stopped: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MatchHandle {
    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn label(&self) -> String {
        self.label.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Producer for the match's inbound queue.
    pub fn sender(&self) -> InboundSender {
        self.inbound.clone()
    }

    fn send(&self, command: MatchCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| MatchError::Stopped)
    }

    /// Run JoinAttempt on the match thread and wait for the answer.
    pub fn join_attempt(&self, candidate: JoinCandidate, metadata: Value, timeout: Duration) -> Result<JoinAttemptOutcome> {
        let (reply, answer) = bounded(1);
        self.send(MatchCommand::JoinAttempt {
            candidate,
            metadata,
            reply,
        })?;
        match answer.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(MatchError::Timeout(format!(
                "join attempt on {} after {:?}",
                self.match_id, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(MatchError::Stopped),
        }
    }

    pub fn join(&self, presences: Vec<Presence>) -> Result<()> {
        self.send(MatchCommand::Join(presences))
    }

    pub fn leave(&self, presences: Vec<Presence>) -> Result<()> {
        self.send(MatchCommand::Leave(presences))
    }

    /// Terminate the match and wait for its thread to exit.
    pub fn stop(&self, grace_seconds: i64) -> Result<()> {
        // Already gone is fine: the thread is joined below either way.
        let _ = self.send(MatchCommand::Stop { grace_seconds });
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return Err(MatchError::lifecycle("match cannot stop itself from its own thread"));
            }
            handle
                .join()
                .map_err(|_| MatchError::handler(format!("match thread {} panicked", self.match_id)))?;
        }
        Ok(())
    }
}

/// Drives one [`MatchCore`] on a dedicated thread.
pub struct MatchRunner {
    core: MatchCore,
    router: Arc<dyn MessageRouter>,
    directory: Arc<PresenceDirectory>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MatchMetrics>>,
}

impl MatchRunner {
    pub fn new(core: MatchCore, router: Arc<dyn MessageRouter>, directory: Arc<PresenceDirectory>) -> Self {
        Self {
            core,
            router,
            directory,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<MatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the thread and run Init on it. Init errors are returned here and
    /// no tick is ever scheduled.
    pub fn spawn(self, params: Value) -> Result<MatchHandle> {
        let match_id = self.core.match_id().to_string();
        let inbound = self.core.sender();
        let label = self.core.label_handle();
        let stopped = self.core.stopped_flag();

        let (command_tx, command_rx) = unbounded();
        let (init_tx, init_rx) = bounded(1);

        let thread = thread::Builder::new()
            .name(format!("match-{}", self.core.id()))
            .spawn(move || {
                let deferred: Arc<Mutex<Vec<DeferredMessage>>> = Arc::default();
                let buffer = deferred.clone();
                let defer: DeferFn = Arc::new(move |msg: DeferredMessage| {
                    buffer.lock().push(msg);
                    Ok(())
                });

                let MatchRunner {
                    mut core,
                    router,
                    directory,
                    #[cfg(feature = "metrics")]
                    metrics,
                } = self;

                let init = core.init(directory.clone(), defer, &params);
                let tick_rate = match &init {
                    Ok(outcome) => outcome.tick_rate,
                    Err(_) => 0,
                };
                let failed = init.is_err();
                let _ = init_tx.send(init);
                if failed {
                    return;
                }

                let worker = Worker {
                    core,
                    router,
                    directory,
                    deferred,
                    commands: command_rx,
                    #[cfg(feature = "metrics")]
                    metrics,
                };
                worker.run(tick_rate);
            })?;

        let outcome = match init_rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(MatchError::handler(format!("match thread {} exited during init", match_id))),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };

        Ok(MatchHandle {
            match_id,
            tick_rate: outcome.tick_rate,
            commands: command_tx,
            inbound,
            label,
            stopped,
            thread: Mutex::new(Some(thread)),
        })
    }
}

struct Worker {
    core: MatchCore,
    router: Arc<dyn MessageRouter>,
    directory: Arc<PresenceDirectory>,
    deferred: Arc<Mutex<Vec<DeferredMessage>>>,
    commands: Receiver<MatchCommand>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MatchMetrics>>,
}

impl Worker {
    fn run(mut self, tick_rate: u32) {
        let interval = Duration::from_micros(1_000_000 / tick_rate.max(1) as u64);
        let mut deadline = Instant::now() + interval;

        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.matches_active.inc();
                metrics.matches_total.inc();
            }
        }

        info!(match_id = %self.core.match_id(), tick_rate, "match running");

        loop {
            match self.commands.recv_deadline(deadline) {
                Ok(MatchCommand::Stop { grace_seconds }) => {
                    self.stop(grace_seconds);
                    break;
                }
                Ok(command) => {
                    if let Err((call, e)) = self.apply(command) {
                        self.fail(call, e);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.tick() {
                        self.fail("match_loop", e);
                        break;
                    }
                    deadline += interval;
                    let now = Instant::now();
                    if deadline < now {
                        // Overran: skip the missed ticks rather than bursting.
                        deadline = now + interval;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.stop(0);
                    break;
                }
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.matches_active.dec();
            }
        }
    }

    fn apply(&mut self, command: MatchCommand) -> std::result::Result<(), (&'static str, MatchError)> {
        match command {
            MatchCommand::JoinAttempt {
                candidate,
                metadata,
                reply,
            } => {
                let result = self.core.join_attempt(&candidate, &metadata);
                let failure = result.as_ref().err().cloned();
                self.settle(failure.is_none());
                let _ = reply.send(result);
                match failure {
                    Some(e) => Err(("match_join_attempt", e)),
                    None => Ok(()),
                }
            }
            MatchCommand::Join(presences) => {
                let result = self.core.join(&presences);
                self.settle(result.is_ok());
                result.map_err(|e| ("match_join", e))
            }
            MatchCommand::Leave(presences) => {
                let result = self.core.leave(&presences);
                self.settle(result.is_ok());
                result.map_err(|e| ("match_leave", e))
            }
            MatchCommand::Stop { .. } => Ok(()),
        }
    }

    fn tick(&mut self) -> Result<()> {
        let started = Instant::now();
        let outcome = self.core.tick();
        self.settle(outcome.is_ok());

        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.record_tick(started.elapsed().as_secs_f64());
            }
        }

        let outcome = outcome?;
        debug!(
            match_id = %self.core.match_id(),
            tick = self.core.tick_count(),
            ?outcome,
            elapsed_us = started.elapsed().as_micros() as u64,
            "tick"
        );
        Ok(())
    }

    /// Deliver what the last call deferred if it committed, drop it otherwise.
    fn settle(&self, committed: bool) {
        let pending = std::mem::take(&mut *self.deferred.lock());
        if !committed {
            if !pending.is_empty() {
                debug!(match_id = %self.core.match_id(), dropped = pending.len(), "discarding deferred broadcasts");
            }
            return;
        }
        for message in pending {
            self.router
                .send_to_presence_ids(&message.presence_ids, &message.envelope, message.reliable);
        }
    }

    fn stop(&mut self, grace_seconds: i64) {
        let result = self.core.terminate(grace_seconds);
        self.settle(result.is_ok());
        if let Err(e) = result {
            warn!(match_id = %self.core.match_id(), error = %e, "match_terminate failed");
        }
    }

    fn fail(&mut self, call: &str, e: MatchError) {
        error!(match_id = %self.core.match_id(), call, error = %e, "match stopped on error");

        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.record_handler_error(call);
            }
        }

        self.core.mark_stopped();
        let presence_ids = self.directory.list_presence_ids();
        if !presence_ids.is_empty() {
            self.router
                .send_to_presence_ids(&presence_ids, &Envelope::match_error(MATCH_ERROR_MESSAGE), true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastRequest;
    use crate::core::tests::{RecordingRegistry, ScriptedHandler};
    use crate::envelope::ErrorMessage;
    use crate::queue::InboundMessage;
    use crate::router::LocalRouter;
    use serde_json::json;
    use uuid::Uuid;

    fn spawn(handler: ScriptedHandler) -> Result<(MatchHandle, Arc<LocalRouter>, Arc<PresenceDirectory>)> {
        let router = Arc::new(LocalRouter::new());
        let directory = Arc::new(PresenceDirectory::new());
        let core = MatchCore::new(
            Uuid::new_v4(),
            "node-1",
            Box::new(handler),
            router.clone(),
            Arc::new(RecordingRegistry::default()),
        );
        let handle = MatchRunner::new(core, router.clone(), directory.clone()).spawn(json!({}))?;
        Ok((handle, router, directory))
    }

    fn fast() -> Value {
        json!({"state": {"n": 0}, "tick_rate": 30, "label": "fast"})
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + Duration::from_secs(5);
        while Instant::now() < until {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_init_error_returned_to_creator() {
        let result = spawn(ScriptedHandler::new(json!({"state": {}, "tick_rate": 0})));
        assert!(matches!(result, Err(MatchError::Configuration(_))));
    }

    #[test]
    fn test_ticks_deliver_inbound_and_deferred() {
        let handler = ScriptedHandler::new(fast()).on_tick(|d, state, messages| {
            for msg in messages {
                d.broadcast_message_deferred(BroadcastRequest::new(msg.op_code, msg.data.clone()))?;
            }
            Ok(json!({ "state": state }))
        });
        let (handle, router, directory) = spawn(handler).unwrap();
        assert_eq!(handle.tick_rate(), 30);
        assert_eq!(handle.label(), "fast");

        let p = Presence::new(Uuid::new_v4(), Uuid::new_v4(), "a", "node-1");
        directory.add(p.clone());
        handle
            .sender()
            .send(InboundMessage::new(p.clone(), 5, Some(b"hi".to_vec())))
            .unwrap();

        assert!(wait_for(|| router.pending(&p.id()) == 1));
        let out = router.take(&p.id());
        assert_eq!(out[0].envelope.match_data().unwrap().op_code, 5);

        handle.stop(0).unwrap();
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_join_attempt_round_trip() {
        let (handle, _router, _directory) = spawn(ScriptedHandler::new(fast())).unwrap();
        let candidate = JoinCandidate::new(Presence::new(Uuid::new_v4(), Uuid::new_v4(), "b", "node-1"));
        let outcome = handle
            .join_attempt(candidate, json!({}), Duration::from_secs(5))
            .unwrap();
        assert!(outcome.accepted);
        handle.stop(0).unwrap();
    }

    #[test]
    fn test_handler_error_tears_down_match() {
        let handler = ScriptedHandler::new(fast()).on_tick(|_, _, _| Err(MatchError::handler("boom")));
        let router = Arc::new(LocalRouter::new());
        let directory = Arc::new(PresenceDirectory::new());
        let p = Presence::new(Uuid::new_v4(), Uuid::new_v4(), "a", "node-1");
        directory.add(p.clone());

        let core = MatchCore::new(
            Uuid::new_v4(),
            "node-1",
            Box::new(handler),
            router.clone(),
            Arc::new(RecordingRegistry::default()),
        );
        let handle = MatchRunner::new(core, router.clone(), directory).spawn(json!({})).unwrap();

        assert!(wait_for(|| handle.is_stopped()));
        handle.stop(0).unwrap();

        let out = router.take(&p.id());
        assert_eq!(
            out.last().map(|o| &o.envelope),
            Some(&Envelope::Error(ErrorMessage {
                code: crate::envelope::RUNTIME_EXCEPTION,
                message: MATCH_ERROR_MESSAGE.to_string(),
            }))
        );
        assert!(matches!(handle.join(vec![p]), Err(MatchError::Stopped)));
    }

    #[test]
    fn test_failed_tick_discards_deferred() {
        let handler = ScriptedHandler::new(fast()).on_tick(|d, _, _| {
            d.broadcast_message_deferred(BroadcastRequest::new(42, None))?;
            Err(MatchError::handler("boom"))
        });
        let router = Arc::new(LocalRouter::new());
        let directory = Arc::new(PresenceDirectory::new());
        let p = Presence::new(Uuid::new_v4(), Uuid::new_v4(), "a", "node-1");
        directory.add(p.clone());

        let core = MatchCore::new(
            Uuid::new_v4(),
            "node-1",
            Box::new(handler),
            router.clone(),
            Arc::new(RecordingRegistry::default()),
        );
        let handle = MatchRunner::new(core, router.clone(), directory).spawn(json!({})).unwrap();

        assert!(wait_for(|| handle.is_stopped()));
        handle.stop(0).unwrap();

        let out = router.take(&p.id());
        assert_eq!(out.len(), 1);
        assert!(out[0].envelope.match_data().is_none());
        assert!(matches!(out[0].envelope, Envelope::Error(_)));
    }

    #[test]
    fn test_dropping_handle_terminates() {
        let handler = ScriptedHandler::new(fast());
        let terminated = handler.terminated_with.clone();
        let (handle, _router, _directory) = spawn(handler).unwrap();
        let stopped = handle.stopped.clone();
        let thread = handle.thread.lock().take();
        drop(handle);

        if let Some(thread) = thread {
            thread.join().unwrap();
        }
        assert!(stopped.load(Ordering::Acquire));
        assert_eq!(*terminated.lock(), Some(0));
    }
}

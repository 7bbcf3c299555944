//! Match Core state machine.
//!
//! `Uninitialized -> Running -> Terminating -> Stopped`. The core owns the
//! opaque state, the tick counter, the label and the stopped flag, and is
//! driven by a scheduler (see [`crate::runner`]) one call at a time. Each
//! call threads the state through the handler and replaces it only once the
//! handler's return value validates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastAuthorizer, BroadcastRequest};
use crate::context::{match_id_string, JoinCandidate, MatchContext};
use crate::envelope::DeferredMessage;
use crate::error::{MatchError, Result};
use crate::handler::{MatchDispatcher, MatchHandler};
use crate::presence::{Presence, PresenceDirectory, PresenceStream};
use crate::queue::{InboundQueue, InboundSender, DEFAULT_QUEUE_CAPACITY};
use crate::result::{loop_state_from_value, state_from_value, InitResult, JoinAttemptResult};
use crate::router::{DeferFn, MatchRegistry, MessageRouter};

#[cfg(feature = "metrics")]
use crate::metrics::MatchMetrics;

/// Match lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLifecycle {
    Uninitialized,
    Running,
    Terminating,
    Stopped,
}

/// Shared handle to the match label, readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct MatchLabel(Arc<RwLock<String>>);

impl MatchLabel {
    pub fn get(&self) -> String {
        self.0.read().clone()
    }

    pub(crate) fn set(&self, label: impl Into<String>) {
        *self.0.write() = label.into();
    }
}

/// Fixed tick rate and label chosen by Init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub tick_rate: u32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAttemptOutcome {
    pub accepted: bool,
    /// Empty when accepted.
    pub reject_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The handler returned a new state.
    Updated,
    /// The handler returned null; state kept.
    Unchanged,
}

/// Everything a handler's dispatcher may touch. Kept apart from the handler
/// so both can be borrowed during one call.
struct Shared {
    id: Uuid,
    id_str: String,
    stream: PresenceStream,
    directory: Arc<PresenceDirectory>,
    router: Arc<dyn MessageRouter>,
    registry: Arc<dyn MatchRegistry>,
    defer: Option<DeferFn>,
    label: MatchLabel,
    stopped: Arc<AtomicBool>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MatchMetrics>>,
}

impl Shared {
    fn authorizer(&self) -> BroadcastAuthorizer<'_> {
        BroadcastAuthorizer::new(&self.id_str, &self.directory, &self.stopped)
    }

    #[cfg(feature = "metrics")]
    fn record_broadcast(&self, deferred: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_broadcast(deferred);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_broadcast(&self, _deferred: bool) {}
}

/// Dispatcher bound to the core for one lifecycle call.
struct CoreDispatcher<'a> {
    shared: &'a Shared,
}

impl MatchDispatcher for CoreDispatcher<'_> {
    fn broadcast_message(&self, request: BroadcastRequest) -> Result<()> {
        if let Some(resolved) = self.shared.authorizer().resolve(&request)? {
            debug!(
                match_id = %self.shared.id_str,
                op_code = request.op_code,
                recipients = resolved.recipients.len(),
                "broadcast"
            );
            self.shared
                .router
                .send_to_presence_ids(&resolved.recipients, &resolved.envelope, resolved.reliable);
            self.shared.record_broadcast(false);
        }
        Ok(())
    }

    fn broadcast_message_deferred(&self, request: BroadcastRequest) -> Result<()> {
        let Some(resolved) = self.shared.authorizer().resolve(&request)? else {
            return Ok(());
        };
        let defer = self
            .shared
            .defer
            .as_ref()
            .ok_or_else(|| MatchError::lifecycle("deferred delivery is not bound before init"))?;

        defer(DeferredMessage {
            presence_ids: resolved.recipients,
            envelope: resolved.envelope,
            reliable: resolved.reliable,
        })
        .map_err(|e| MatchError::Router(format!("error deferring message broadcast: {}", e)))?;
        self.shared.record_broadcast(true);
        Ok(())
    }

    fn match_kick(&self, presences: &Value) -> Result<()> {
        let Some(targets) = self.shared.authorizer().kick_targets(presences)? else {
            return Ok(());
        };
        if targets.is_empty() {
            return Ok(());
        }
        debug!(match_id = %self.shared.id_str, count = targets.len(), "kick");
        self.shared.registry.kick(&self.shared.stream, targets);
        Ok(())
    }

    fn match_label_update(&self, label: &str) -> Result<()> {
        self.shared.authorizer().check_running()?;
        if let Err(e) = self.shared.registry.update_match_label(self.shared.id, label) {
            warn!(match_id = %self.shared.id_str, error = %e, "error updating match label");
            return Err(e);
        }
        self.shared.label.set(label);
        Ok(())
    }
}

/// One authoritative match instance.
pub struct MatchCore {
    node: String,
    env: HashMap<String, String>,
    handler: Box<dyn MatchHandler>,
    queue: InboundQueue,
    shared: Shared,
    lifecycle: MatchLifecycle,
    state: Value,
    tick: i64,
    tick_rate: u32,
}

impl MatchCore {
    pub fn new(
        id: Uuid,
        node: impl Into<String>,
        handler: Box<dyn MatchHandler>,
        router: Arc<dyn MessageRouter>,
        registry: Arc<dyn MatchRegistry>,
    ) -> Self {
        let node = node.into();
        Self {
            env: HashMap::new(),
            handler,
            queue: InboundQueue::new(DEFAULT_QUEUE_CAPACITY),
            shared: Shared {
                id,
                id_str: match_id_string(id, &node),
                stream: PresenceStream::authoritative(id, node.clone()),
                directory: Arc::new(PresenceDirectory::new()),
                router,
                registry,
                defer: None,
                label: MatchLabel::default(),
                stopped: Arc::new(AtomicBool::new(false)),
                #[cfg(feature = "metrics")]
                metrics: None,
            },
            node,
            lifecycle: MatchLifecycle::Uninitialized,
            state: Value::Null,
            tick: 0,
            tick_rate: 0,
        }
    }

    /// Environment exposed to handlers as `ctx.env`.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Replace the inbound queue. Senders taken before this point go stale.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue = InboundQueue::new(capacity);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<MatchMetrics>) -> Self {
        self.shared.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// `<uuid>.<node>`
    pub fn match_id(&self) -> &str {
        &self.shared.id_str
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn stream(&self) -> &PresenceStream {
        &self.shared.stream
    }

    pub fn lifecycle(&self) -> MatchLifecycle {
        self.lifecycle
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn tick_count(&self) -> i64 {
        self.tick
    }

    /// Zero before Init.
    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn label(&self) -> String {
        self.shared.label.get()
    }

    /// Label handle for readers on other threads.
    pub fn label_handle(&self) -> MatchLabel {
        self.shared.label.clone()
    }

    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.shared.stopped.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn directory(&self) -> Arc<PresenceDirectory> {
        self.shared.directory.clone()
    }

    pub fn sender(&self) -> InboundSender {
        self.queue.sender()
    }

    /// Tear down without calling the handler; further calls fail.
    pub fn mark_stopped(&mut self) {
        self.lifecycle = MatchLifecycle::Stopped;
        self.shared.stopped.store(true, Ordering::Release);
    }

    fn context(&self) -> MatchContext {
        MatchContext::new(self.shared.id_str.clone(), self.node.clone())
            .with_env(self.env.clone())
            .with_label(self.shared.label.get())
            .with_tick_rate(self.tick_rate)
    }

    fn ensure_running(&self, call: &str) -> Result<()> {
        if self.lifecycle != MatchLifecycle::Running {
            return Err(MatchError::lifecycle(format!(
                "{} called while match is {:?}",
                call, self.lifecycle
            )));
        }
        Ok(())
    }

    /// Run the handler's init, fixing tick rate and label, and bind the
    /// directory and deferred-delivery function.
    pub fn init(&mut self, directory: Arc<PresenceDirectory>, defer: DeferFn, params: &Value) -> Result<InitOutcome> {
        if self.lifecycle != MatchLifecycle::Uninitialized {
            return Err(MatchError::lifecycle(format!(
                "match_init called while match is {:?}",
                self.lifecycle
            )));
        }

        let ctx = self.context();
        let raw = self.handler.init(&ctx, params)?;
        let init = InitResult::from_value(raw)?;

        self.state = init.state;
        self.tick_rate = init.tick_rate;
        self.shared.label.set(init.label.clone());
        self.shared.directory = directory;
        self.shared.defer = Some(defer);
        self.lifecycle = MatchLifecycle::Running;

        info!(
            match_id = %self.shared.id_str,
            tick_rate = init.tick_rate,
            label = %init.label,
            "match initialized"
        );

        Ok(InitOutcome {
            tick_rate: init.tick_rate,
            label: init.label,
        })
    }

    /// Ask the handler whether a candidate may join. Never touches the directory.
    pub fn join_attempt(&mut self, candidate: &JoinCandidate, metadata: &Value) -> Result<JoinAttemptOutcome> {
        self.ensure_running("match_join_attempt")?;

        let ctx = self.context().with_caller(candidate.caller_identity());
        let dispatcher = CoreDispatcher { shared: &self.shared };
        let raw = self
            .handler
            .join_attempt(&ctx, &dispatcher, self.tick, &self.state, candidate, metadata)?;
        let result = JoinAttemptResult::from_value(raw)?;

        self.state = result.state;
        debug!(
            match_id = %self.shared.id_str,
            session_id = %candidate.presence.session_id,
            accepted = result.accept,
            "join attempt"
        );
        Ok(JoinAttemptOutcome {
            accepted: result.accept,
            reject_reason: result.reject_msg,
        })
    }

    pub fn join(&mut self, presences: &[Presence]) -> Result<()> {
        self.ensure_running("match_join")?;

        let ctx = self.context();
        let dispatcher = CoreDispatcher { shared: &self.shared };
        let raw = self
            .handler
            .join(&ctx, &dispatcher, self.tick, &self.state, presences)?;
        self.state = state_from_value(raw, "match_join")?;
        Ok(())
    }

    pub fn leave(&mut self, presences: &[Presence]) -> Result<()> {
        self.ensure_running("match_leave")?;

        let ctx = self.context();
        let dispatcher = CoreDispatcher { shared: &self.shared };
        let raw = self
            .handler
            .leave(&ctx, &dispatcher, self.tick, &self.state, presences)?;
        self.state = state_from_value(raw, "match_leave")?;
        Ok(())
    }

    /// One Loop step: drain the messages queued so far, run the handler, and
    /// advance the tick counter.
    pub fn tick(&mut self) -> Result<LoopOutcome> {
        self.ensure_running("match_loop")?;

        let messages = self.queue.drain_snapshot();
        let ctx = self.context();
        let dispatcher = CoreDispatcher { shared: &self.shared };
        let raw = self
            .handler
            .tick(&ctx, &dispatcher, self.tick, &self.state, &messages)?;

        let outcome = match loop_state_from_value(raw)? {
            Some(state) => {
                self.state = state;
                LoopOutcome::Updated
            }
            None => LoopOutcome::Unchanged,
        };
        self.tick += 1;
        Ok(outcome)
    }

    /// Final handler call. The match is `Stopped` afterwards whatever the
    /// handler returned.
    pub fn terminate(&mut self, grace_seconds: i64) -> Result<()> {
        self.ensure_running("match_terminate")?;
        self.lifecycle = MatchLifecycle::Terminating;

        let ctx = self.context();
        let dispatcher = CoreDispatcher { shared: &self.shared };
        let result = self
            .handler
            .terminate(&ctx, &dispatcher, self.tick, &self.state, grace_seconds)
            .and_then(|raw| state_from_value(raw, "match_terminate"));

        self.mark_stopped();
        self.state = result?;
        info!(match_id = %self.shared.id_str, tick = self.tick, "match terminated");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handler::NullDispatcher;
    use crate::queue::InboundMessage;
    use crate::router::LocalRouter;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Registry double recording kicks and label updates.
    #[derive(Default)]
    pub(crate) struct RecordingRegistry {
        pub kicked: Mutex<Vec<Presence>>,
        pub labels: Mutex<Vec<String>>,
        pub fail_labels: AtomicBool,
    }

    impl MatchRegistry for RecordingRegistry {
        fn kick(&self, _stream: &PresenceStream, presences: Vec<Presence>) {
            self.kicked.lock().extend(presences);
        }

        fn update_match_label(&self, _match_id: Uuid, label: &str) -> Result<()> {
            if self.fail_labels.load(Ordering::Relaxed) {
                return Err(MatchError::Registry("label index unavailable".into()));
            }
            self.labels.lock().push(label.to_string());
            Ok(())
        }
    }

    type Script = Box<dyn FnMut(&dyn MatchDispatcher, &Value, &[InboundMessage]) -> Result<Value> + Send>;

    fn keep_state(_: &dyn MatchDispatcher, state: &Value, _: &[InboundMessage]) -> Result<Value> {
        Ok(json!({ "state": state }))
    }

    /// Handler whose loop behaviour is supplied per test.
    pub(crate) struct ScriptedHandler {
        init: Value,
        join_attempt: Value,
        on_tick: Script,
        terminate_label: Option<String>,
        pub seen: Arc<Mutex<Vec<Vec<i64>>>>,
        pub terminated_with: Arc<Mutex<Option<i64>>>,
    }

    impl ScriptedHandler {
        pub(crate) fn new(init: Value) -> Self {
            Self {
                init,
                join_attempt: json!({"accept": true, "state": {"score": 0}}),
                on_tick: Box::new(keep_state),
                terminate_label: None,
                seen: Arc::default(),
                terminated_with: Arc::default(),
            }
        }

        pub(crate) fn on_tick(
            mut self,
            f: impl FnMut(&dyn MatchDispatcher, &Value, &[InboundMessage]) -> Result<Value> + Send + 'static,
        ) -> Self {
            self.on_tick = Box::new(f);
            self
        }

        /// Call `match_label_update(label)` from terminate.
        pub(crate) fn relabel_on_terminate(mut self, label: &str) -> Self {
            self.terminate_label = Some(label.to_string());
            self
        }

        fn with_join_attempt(mut self, result: Value) -> Self {
            self.join_attempt = result;
            self
        }
    }

    impl MatchHandler for ScriptedHandler {
        fn init(&mut self, _ctx: &MatchContext, _params: &Value) -> Result<Value> {
            Ok(self.init.clone())
        }

        fn join_attempt(
            &mut self,
            ctx: &MatchContext,
            _dispatcher: &dyn MatchDispatcher,
            _tick: i64,
            _state: &Value,
            candidate: &JoinCandidate,
            _metadata: &Value,
        ) -> Result<Value> {
            let caller = ctx.caller.as_ref().ok_or_else(|| MatchError::handler("no caller"))?;
            assert_eq!(caller.username, candidate.presence.username);
            Ok(self.join_attempt.clone())
        }

        fn join(
            &mut self,
            _ctx: &MatchContext,
            _dispatcher: &dyn MatchDispatcher,
            _tick: i64,
            state: &Value,
            presences: &[Presence],
        ) -> Result<Value> {
            let players = state["players"].as_i64().unwrap_or(0) + presences.len() as i64;
            Ok(json!({"state": {"players": players}}))
        }

        fn leave(
            &mut self,
            _ctx: &MatchContext,
            _dispatcher: &dyn MatchDispatcher,
            _tick: i64,
            state: &Value,
            presences: &[Presence],
        ) -> Result<Value> {
            let players = state["players"].as_i64().unwrap_or(0) - presences.len() as i64;
            Ok(json!({"state": {"players": players}}))
        }

        fn tick(
            &mut self,
            _ctx: &MatchContext,
            dispatcher: &dyn MatchDispatcher,
            _tick: i64,
            state: &Value,
            messages: &[InboundMessage],
        ) -> Result<Value> {
            self.seen.lock().push(messages.iter().map(|m| m.op_code).collect());
            (self.on_tick)(dispatcher, state, messages)
        }

        fn terminate(
            &mut self,
            _ctx: &MatchContext,
            dispatcher: &dyn MatchDispatcher,
            _tick: i64,
            state: &Value,
            grace_seconds: i64,
        ) -> Result<Value> {
            *self.terminated_with.lock() = Some(grace_seconds);
            if let Some(label) = &self.terminate_label {
                dispatcher.match_label_update(label)?;
            }
            dispatcher.broadcast_message(BroadcastRequest::new(99, None))?;
            Ok(json!({ "state": state }))
        }
    }

    struct Harness {
        core: MatchCore,
        router: Arc<LocalRouter>,
        registry: Arc<RecordingRegistry>,
        directory: Arc<PresenceDirectory>,
        deferred: Arc<Mutex<Vec<DeferredMessage>>>,
    }

    fn harness(handler: ScriptedHandler) -> Harness {
        let router = Arc::new(LocalRouter::new());
        let registry = Arc::new(RecordingRegistry::default());
        let core = MatchCore::new(Uuid::new_v4(), "node-1", Box::new(handler), router.clone(), registry.clone());
        Harness {
            core,
            router,
            registry,
            directory: Arc::new(PresenceDirectory::new()),
            deferred: Arc::default(),
        }
    }

    impl Harness {
        fn init(&mut self) -> Result<InitOutcome> {
            let deferred = self.deferred.clone();
            let defer: DeferFn = Arc::new(move |msg: DeferredMessage| {
                deferred.lock().push(msg);
                Ok(())
            });
            self.core.init(self.directory.clone(), defer, &json!({}))
        }

        fn admit(&self, name: &str) -> Presence {
            let p = Presence::new(Uuid::new_v4(), Uuid::new_v4(), name, "node-1");
            self.directory.add(p.clone());
            p
        }
    }

    fn arena() -> Value {
        json!({"state": {"score": 0}, "tick_rate": 10, "label": "arena-1"})
    }

    #[test]
    fn test_init_enters_running() {
        let mut h = harness(ScriptedHandler::new(arena()));
        let outcome = h.init().unwrap();

        assert_eq!(outcome, InitOutcome { tick_rate: 10, label: "arena-1".into() });
        assert_eq!(h.core.lifecycle(), MatchLifecycle::Running);
        assert_eq!(h.core.tick_rate(), 10);
        assert_eq!(h.core.label(), "arena-1");
        assert_eq!(h.core.label(), h.core.label());
        assert_eq!(h.core.state(), &json!({"score": 0}));
    }

    #[test]
    fn test_init_bad_tick_rate_stays_uninitialized() {
        let mut h = harness(ScriptedHandler::new(json!({"state": {}, "tick_rate": 31})));
        assert!(matches!(h.init(), Err(MatchError::Configuration(_))));
        assert_eq!(h.core.lifecycle(), MatchLifecycle::Uninitialized);
        assert!(matches!(h.core.tick(), Err(MatchError::Lifecycle(_))));
    }

    #[test]
    fn test_double_init_rejected() {
        let mut h = harness(ScriptedHandler::new(arena()));
        h.init().unwrap();
        assert!(matches!(h.init(), Err(MatchError::Lifecycle(_))));
    }

    #[test]
    fn test_join_attempt_reject_leaves_directory_alone() {
        let handler = ScriptedHandler::new(arena())
            .with_join_attempt(json!({"accept": false, "reject_msg": "full", "state": {"seen": 1}}));
        let mut h = harness(handler);
        h.init().unwrap();

        let candidate = JoinCandidate::new(Presence::new(Uuid::new_v4(), Uuid::new_v4(), "bob", "node-1"));
        let outcome = h.core.join_attempt(&candidate, &json!({})).unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.reject_reason, "full");
        assert_eq!(h.core.state(), &json!({"seen": 1}));
        assert!(h.directory.is_empty());
    }

    #[test]
    fn test_join_and_leave_thread_state() {
        let mut h = harness(ScriptedHandler::new(arena()));
        h.init().unwrap();
        let a = h.admit("a");
        let b = h.admit("b");

        h.core.join(&[a.clone(), b]).unwrap();
        assert_eq!(h.core.state(), &json!({"players": 2}));
        h.core.leave(&[a]).unwrap();
        assert_eq!(h.core.state(), &json!({"players": 1}));
    }

    #[test]
    fn test_targeted_broadcast_reaches_only_member() {
        let target: Arc<Mutex<Option<Presence>>> = Arc::default();
        let slot = target.clone();
        let handler = ScriptedHandler::new(arena()).on_tick(move |d, state, _| {
            if let Some(p) = slot.lock().as_ref() {
                d.broadcast_message(BroadcastRequest::new(7, Some(b"ping".to_vec())).to(&[p.id()]))?;
            }
            Ok(json!({ "state": state }))
        });
        let mut h = harness(handler);
        h.init().unwrap();
        let a = h.admit("a");
        let b = h.admit("b");
        *target.lock() = Some(a.clone());

        h.core.tick().unwrap();

        let out = h.router.take(&a.id());
        assert_eq!(out.len(), 1);
        let data = out[0].envelope.match_data().unwrap();
        assert_eq!(data.op_code, 7);
        assert_eq!(data.data.as_deref(), Some(&b"ping"[..]));
        assert!(data.presence.is_none());
        assert!(out[0].reliable);
        assert_eq!(h.router.pending(&b.id()), 0);
    }

    #[test]
    fn test_loop_null_keeps_state_and_advances_tick() {
        let handler = ScriptedHandler::new(arena()).on_tick(|_, _, _| Ok(Value::Null));
        let mut h = harness(handler);
        h.init().unwrap();

        assert_eq!(h.core.tick().unwrap(), LoopOutcome::Unchanged);
        assert_eq!(h.core.state(), &json!({"score": 0}));
        assert_eq!(h.core.tick_count(), 1);
    }

    #[test]
    fn test_malformed_loop_return_keeps_state() {
        let handler = ScriptedHandler::new(arena()).on_tick(|_, _, _| Ok(json!({"stat": 1})));
        let mut h = harness(handler);
        h.init().unwrap();

        assert!(matches!(h.core.tick(), Err(MatchError::Protocol(_))));
        assert_eq!(h.core.state(), &json!({"score": 0}));
        assert_eq!(h.core.tick_count(), 0);
    }

    #[test]
    fn test_messages_enqueued_during_loop_wait_a_tick() {
        let h0 = harness(ScriptedHandler::new(arena()));
        let tx = h0.core.sender();
        let sender = Presence::new(Uuid::new_v4(), Uuid::new_v4(), "s", "node-1");
        let late_sender = sender.clone();
        let late_tx = tx.clone();
        let mut first = true;

        let handler = ScriptedHandler::new(arena()).on_tick(move |_, state, _| {
            if first {
                late_tx.send(InboundMessage::new(late_sender.clone(), 4, None))?;
                first = false;
            }
            Ok(json!({ "state": state }))
        });
        let seen = handler.seen.clone();

        // Rebuild around the same queue: swap the handler in the harness.
        let mut h = h0;
        h.core.handler = Box::new(handler);
        h.init().unwrap();

        for op in 1..=3 {
            tx.send(InboundMessage::new(sender.clone(), op, None)).unwrap();
        }
        h.core.tick().unwrap();
        h.core.tick().unwrap();

        assert_eq!(*seen.lock(), vec![vec![1, 2, 3], vec![4]]);
    }

    #[test]
    fn test_deferred_broadcast_goes_to_defer_fn() {
        let handler = ScriptedHandler::new(arena()).on_tick(|d, state, _| {
            d.broadcast_message_deferred(BroadcastRequest::new(3, None))?;
            Ok(json!({ "state": state }))
        });
        let mut h = harness(handler);
        h.init().unwrap();
        let a = h.admit("a");

        h.core.tick().unwrap();
        assert_eq!(h.router.total_pending(), 0);
        let deferred = h.deferred.lock();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].presence_ids, vec![a.id()]);
    }

    #[test]
    fn test_kick_and_label_update() {
        let handler = ScriptedHandler::new(arena()).on_tick(|d, state, _| {
            d.match_kick(&Value::Null)?;
            d.match_kick(&json!([{
                "user_id": Uuid::nil().to_string(),
                "session_id": Uuid::nil().to_string(),
                "node_id": "node-1",
            }]))?;
            d.match_label_update("arena-2")?;
            Ok(json!({ "state": state }))
        });
        let mut h = harness(handler);
        h.init().unwrap();
        h.core.tick().unwrap();

        assert_eq!(h.registry.kicked.lock().len(), 1);
        assert_eq!(*h.registry.labels.lock(), vec!["arena-2".to_string()]);
        assert_eq!(h.core.label(), "arena-2");
        assert_eq!(h.core.context().match_label, "arena-2");
    }

    #[test]
    fn test_label_registry_failure_keeps_label() {
        let handler = ScriptedHandler::new(arena()).on_tick(|d, state, _| {
            d.match_label_update("arena-2")?;
            Ok(json!({ "state": state }))
        });
        let mut h = harness(handler);
        h.init().unwrap();
        h.registry.fail_labels.store(true, Ordering::Relaxed);

        assert!(matches!(h.core.tick(), Err(MatchError::Registry(_))));
        assert_eq!(h.core.label(), "arena-1");
    }

    #[test]
    fn test_terminate_stops_match() {
        let handler = ScriptedHandler::new(arena());
        let grace = handler.terminated_with.clone();
        let mut h = harness(handler);
        h.init().unwrap();
        let a = h.admit("a");

        h.core.terminate(30).unwrap();

        assert_eq!(*grace.lock(), Some(30));
        // Broadcasts during the terminate call itself still go out.
        assert_eq!(h.router.take(&a.id()).len(), 1);
        assert_eq!(h.core.lifecycle(), MatchLifecycle::Stopped);
        assert!(h.core.is_stopped());
        assert!(matches!(h.core.tick(), Err(MatchError::Lifecycle(_))));
    }

    #[test]
    fn test_stopped_flag_rejects_broadcast() {
        let handler = ScriptedHandler::new(arena()).on_tick(|d, state, _| {
            d.broadcast_message(BroadcastRequest::new(1, None))?;
            Ok(json!({ "state": state }))
        });
        let mut h = harness(handler);
        h.init().unwrap();
        h.core.stopped_flag().store(true, Ordering::Release);

        assert!(matches!(h.core.tick(), Err(MatchError::Stopped)));
    }

    #[test]
    fn test_null_dispatcher_is_inert() {
        let d = NullDispatcher;
        assert!(d.broadcast_message(BroadcastRequest::new(1, None)).is_ok());
        assert!(d.match_label_update("x").is_ok());
    }
}

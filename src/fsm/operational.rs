//! Operational state machine
//!
//! A device may declare a second, user-defined machine over its business
//! states. The machine is described by serializable data (states, events
//! and a transition table) and interpreted at runtime with on-entry and
//! on-exit callbacks registered during hydration. Keeping the descriptor
//! pure data lets the introspection feature serve FSM diagrams without a
//! reflection dependency.

use crate::runtime::scope::DeviceScope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// One row of the transition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub from: String,
    pub event: String,
    pub to: String,
}

/// Timer armed on entry to a state; posts an event unless the state is
/// left first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTimer {
    /// Delay after entry.
    pub after: Duration,
    /// Event posted when the delay elapses while still in the state.
    pub post_event: String,
}

/// Serializable description of an operational machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsmDescriptor {
    /// Initial state serial name.
    pub initial: String,
    /// Declared state serial names.
    pub states: Vec<String>,
    /// Declared event serial names.
    pub events: Vec<String>,
    /// Transition table.
    pub transitions: Vec<TransitionRule>,
    /// Per-state timers.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub timers: HashMap<String, Vec<StateTimer>>,
}

impl FsmDescriptor {
    /// Machine with the given initial state and no transitions yet.
    pub fn new(initial: impl Into<String>) -> Self {
        let initial = initial.into();
        Self {
            initial: initial.clone(),
            states: vec![initial],
            events: Vec::new(),
            transitions: Vec::new(),
            timers: HashMap::new(),
        }
    }

    /// Add a transition, registering unseen states and events.
    pub fn transition(
        mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        let rule = TransitionRule {
            from: from.into(),
            event: event.into(),
            to: to.into(),
        };
        for state in [&rule.from, &rule.to] {
            if !self.states.contains(state) {
                self.states.push(state.clone());
            }
        }
        if !self.events.contains(&rule.event) {
            self.events.push(rule.event.clone());
        }
        self.transitions.push(rule);
        self
    }

    /// Arm a timer on a state.
    pub fn timer(mut self, state: impl Into<String>, after: Duration, post_event: impl Into<String>) -> Self {
        let event = post_event.into();
        if !self.events.contains(&event) {
            self.events.push(event.clone());
        }
        self.timers.entry(state.into()).or_default().push(StateTimer { after, post_event: event });
        self
    }

    fn lookup(&self, state: &str, event: &str) -> Option<&str> {
        self.transitions
            .iter()
            .find(|rule| rule.from == state && rule.event == event)
            .map(|rule| rule.to.as_str())
    }
}

/// Callback fired on entering or leaving a state.
pub type StateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Entry/exit callbacks registered by the hydrator.
#[derive(Clone, Default)]
pub struct OperationalCallbacks {
    on_entry: HashMap<String, Vec<StateCallback>>,
    on_exit: HashMap<String, Vec<StateCallback>>,
}

impl OperationalCallbacks {
    /// Empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an on-entry callback.
    pub fn on_entry(&mut self, state: impl Into<String>, callback: StateCallback) {
        self.on_entry.entry(state.into()).or_default().push(callback);
    }

    /// Register an on-exit callback.
    pub fn on_exit(&mut self, state: impl Into<String>, callback: StateCallback) {
        self.on_exit.entry(state.into()).or_default().push(callback);
    }
}

/// Handle to a running operational machine.
#[derive(Clone)]
pub struct OperationalFsm {
    descriptor: Arc<FsmDescriptor>,
    events: mpsc::UnboundedSender<String>,
    state: watch::Receiver<String>,
}

impl OperationalFsm {
    /// Spawn the interpreter in its declared initial state.
    pub fn spawn(
        scope: &DeviceScope,
        device: crate::meta::Name,
        descriptor: FsmDescriptor,
        callbacks: OperationalCallbacks,
    ) -> Self {
        let descriptor = Arc::new(descriptor);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
        let (state_tx, state_rx) = watch::channel(descriptor.initial.clone());

        let table = descriptor.clone();
        let timer_tx = event_tx.clone();
        let timer_scope = scope.clone();
        scope.spawn(async move {
            let mut state = table.initial.clone();
            let mut timers: Vec<JoinHandle<()>> =
                arm_timers(&timer_scope, &table, &state, &timer_tx);
            for callback in table_callbacks(&callbacks.on_entry, &state) {
                callback(&state);
            }
            while let Some(event) = event_rx.recv().await {
                if !table.events.contains(&event) {
                    tracing::debug!(device = %device, event = %event, "unknown operational event dropped");
                    continue;
                }
                let Some(next) = table.lookup(&state, &event).map(str::to_string) else {
                    tracing::debug!(
                        device = %device,
                        state = %state,
                        event = %event,
                        "operational event dropped in incompatible state"
                    );
                    continue;
                };

                for timer in timers.drain(..) {
                    timer.abort();
                }
                for callback in table_callbacks(&callbacks.on_exit, &state) {
                    callback(&state);
                }
                tracing::debug!(device = %device, from = %state, to = %next, event = %event, "operational transition");
                state = next;
                let _ = state_tx.send(state.clone());
                for callback in table_callbacks(&callbacks.on_entry, &state) {
                    callback(&state);
                }
                timers = arm_timers(&timer_scope, &table, &state, &timer_tx);
            }
        });

        Self {
            descriptor,
            events: event_tx,
            state: state_rx,
        }
    }

    /// Post an event by serial name; FIFO per machine.
    pub fn post(&self, event: impl Into<String>) {
        let _ = self.events.send(event.into());
    }

    /// Current state serial name.
    pub fn current(&self) -> String {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.state.clone()
    }

    /// The descriptor this machine interprets.
    pub fn descriptor(&self) -> &FsmDescriptor {
        &self.descriptor
    }
}

fn table_callbacks<'a>(
    map: &'a HashMap<String, Vec<StateCallback>>,
    state: &str,
) -> impl Iterator<Item = &'a StateCallback> + 'a {
    map.get(state).into_iter().flatten()
}

fn arm_timers(
    scope: &DeviceScope,
    descriptor: &FsmDescriptor,
    state: &str,
    events: &mpsc::UnboundedSender<String>,
) -> Vec<JoinHandle<()>> {
    let Some(timers) = descriptor.timers.get(state) else {
        return Vec::new();
    };
    timers
        .iter()
        .map(|timer| {
            let after = timer.after;
            let event = timer.post_event.clone();
            let tx = events.clone();
            let mut cancelled = scope.cancelled();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(after) => {
                        let _ = tx.send(event);
                    }
                    _ = cancelled.changed() => {}
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor() -> FsmDescriptor {
        FsmDescriptor::new("Idle")
            .transition("Idle", "StartCycle", "Cycling")
            .transition("Cycling", "CycleDone", "Idle")
            .transition("Cycling", "Abort", "Idle")
    }

    #[tokio::test]
    async fn test_transitions_follow_table() {
        let scope = DeviceScope::new();
        let fsm = OperationalFsm::spawn(&scope, "m".into(), descriptor(), OperationalCallbacks::new());
        assert_eq!(fsm.current(), "Idle");
        fsm.post("StartCycle");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fsm.current(), "Cycling");
        fsm.post("CycleDone");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fsm.current(), "Idle");
        scope.cancel();
    }

    #[tokio::test]
    async fn test_unknown_and_incompatible_events_dropped() {
        let scope = DeviceScope::new();
        let fsm = OperationalFsm::spawn(&scope, "m".into(), descriptor(), OperationalCallbacks::new());
        fsm.post("DoesNotExist");
        fsm.post("CycleDone"); // not valid in Idle
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fsm.current(), "Idle");
        scope.cancel();
    }

    #[tokio::test]
    async fn test_entry_exit_callbacks() {
        let scope = DeviceScope::new();
        let entries = Arc::new(AtomicUsize::new(0));
        let exits = Arc::new(AtomicUsize::new(0));
        let mut callbacks = OperationalCallbacks::new();
        let seen = entries.clone();
        callbacks.on_entry("Cycling", Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let seen = exits.clone();
        callbacks.on_exit("Cycling", Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let fsm = OperationalFsm::spawn(&scope, "m".into(), descriptor(), callbacks);
        fsm.post("StartCycle");
        fsm.post("CycleDone");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(entries.load(Ordering::SeqCst), 1);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        scope.cancel();
    }

    #[tokio::test]
    async fn test_timer_posts_event_and_cancels_on_exit() {
        let scope = DeviceScope::new();
        let descriptor = FsmDescriptor::new("Heating")
            .transition("Heating", "Timeout", "Cooling")
            .transition("Heating", "Abort", "Cooling")
            .timer("Heating", Duration::from_millis(30), "Timeout");
        let fsm = OperationalFsm::spawn(&scope, "m".into(), descriptor, OperationalCallbacks::new());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fsm.current(), "Cooling");
        scope.cancel();

        // leaving the state before the delay cancels the timer
        let scope = DeviceScope::new();
        let descriptor = FsmDescriptor::new("Heating")
            .transition("Heating", "Timeout", "Overheated")
            .transition("Heating", "Abort", "Cooling")
            .timer("Heating", Duration::from_millis(60), "Timeout");
        let fsm = OperationalFsm::spawn(&scope, "m".into(), descriptor, OperationalCallbacks::new());
        fsm.post("Abort");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fsm.current(), "Cooling");
        scope.cancel();
    }
}

//! Lifecycle state machine
//!
//! Every device runs the same fixed lifecycle machine:
//!
//! ```text
//! Detached --Attach-->    Attaching
//! Attaching --success-->  Stopped        Attaching --Fail-->  Failed
//! Stopped   --Start-->    Starting       Stopped  --Detach--> Detaching
//! Starting  --success-->  Running        Starting --Fail-->   Failed
//! Running   --Stop-->     Stopping       Running  --Fail-->   Failed
//! Stopping  --success-->  Stopped        Stopping --Fail-->   Failed
//! Failed    --Reset-->    Stopped
//! Detaching --success-->  Detached
//! ```
//!
//! The machine is a small interpreter over a transition table. Entry into
//! a transitional state launches the matching driver hook; the hook's
//! completion posts the success event, its failure posts `Fail`. Events
//! are processed strictly FIFO from a mailbox; a `Fail` posted by a hook
//! takes dispatch priority.

use crate::error::{DeviceError, SerializableDeviceFailure};
use crate::runtime::scope::DeviceScope;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Fixed lifecycle states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString, strum_macros::EnumIter,
)]
pub enum LifecycleState {
    Detached,
    Attaching,
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Detaching,
}

impl LifecycleState {
    /// Whether a hook is running for this state.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            LifecycleState::Attaching
                | LifecycleState::Starting
                | LifecycleState::Stopping
                | LifecycleState::Detaching
        )
    }

    /// Static transition table `(from, event, to)`, also served raw by the
    /// introspection feature to render lifecycle diagrams.
    pub fn transitions() -> &'static [(LifecycleState, &'static str, LifecycleState)] {
        use LifecycleState::*;
        &[
            (Detached, "Attach", Attaching),
            (Attaching, "success", Stopped),
            (Attaching, "Fail", Failed),
            (Stopped, "Start", Starting),
            (Stopped, "Detach", Detaching),
            (Starting, "success", Running),
            (Starting, "Fail", Failed),
            (Running, "Stop", Stopping),
            (Running, "Fail", Failed),
            (Stopping, "success", Stopped),
            (Stopping, "Fail", Failed),
            (Failed, "Reset", Stopped),
            (Detaching, "success", Detached),
        ]
    }
}

/// External and internal lifecycle events.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Attach,
    Start,
    Stop,
    Fail(SerializableDeviceFailure),
    Reset,
    Detach,
    /// Posted by the engine when a hook finishes; carries the phase that
    /// completed.
    PhaseComplete(LifecycleState),
}

impl LifecycleEvent {
    fn table_name(&self) -> &'static str {
        match self {
            LifecycleEvent::Attach => "Attach",
            LifecycleEvent::Start => "Start",
            LifecycleEvent::Stop => "Stop",
            LifecycleEvent::Fail(_) => "Fail",
            LifecycleEvent::Reset => "Reset",
            LifecycleEvent::Detach => "Detach",
            LifecycleEvent::PhaseComplete(_) => "success",
        }
    }
}

/// Asynchronous driver hook.
pub type LifecycleHook =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), DeviceError>> + Send + Sync>;

/// Hook set a driver installs on its device.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    /// Runs while `Attaching`.
    pub on_attach: Option<LifecycleHook>,
    /// Runs while `Starting`.
    pub on_start: Option<LifecycleHook>,
    /// Runs while `Stopping`.
    pub on_stop: Option<LifecycleHook>,
    /// Runs while `Detaching`; failures are logged, never fatal.
    pub on_detach: Option<LifecycleHook>,
    /// Runs after a successful `Starting -> Running` transition.
    pub after_start: Option<LifecycleHook>,
    /// Runs after a successful `Stopping -> Stopped` transition.
    pub after_stop: Option<LifecycleHook>,
}

/// Callback observing committed transitions.
pub type TransitionObserver = Arc<dyn Fn(LifecycleState, LifecycleState) + Send + Sync>;

/// Handle to a running lifecycle machine.
#[derive(Clone)]
pub struct LifecycleFsm {
    events: mpsc::UnboundedSender<LifecycleEvent>,
    state: watch::Receiver<LifecycleState>,
}

impl LifecycleFsm {
    /// Spawn the machine in `Detached` inside the device scope.
    pub fn spawn(
        scope: &DeviceScope,
        device: crate::meta::Name,
        hooks: LifecycleHooks,
        observer: Option<TransitionObserver>,
    ) -> Self {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Detached);

        let hook_scope = scope.clone();
        let loop_fail_tx = fail_tx.clone();
        let loop_event_tx = event_tx.clone();
        scope.spawn(async move {
            let mut state = LifecycleState::Detached;
            loop {
                // a Fail posted by a hook outranks queued external events
                let event = tokio::select! {
                    biased;
                    failure = fail_rx.recv() => match failure {
                        Some(event) => event,
                        None => break,
                    },
                    event = event_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let next = match &event {
                    LifecycleEvent::PhaseComplete(phase) if *phase != state => {
                        // completion of a phase we already left; ignore
                        continue;
                    }
                    _ => lookup(state, event.table_name()),
                };
                let Some(next) = next else {
                    tracing::debug!(
                        device = %device,
                        state = %state,
                        event = event.table_name(),
                        "lifecycle event dropped in incompatible state"
                    );
                    continue;
                };

                let previous = state;
                state = next;
                tracing::debug!(device = %device, from = %previous, to = %state, "lifecycle transition");
                let _ = state_tx.send(state);
                if let Some(observer) = &observer {
                    observer(previous, state);
                }

                match state {
                    LifecycleState::Attaching => launch_hook(
                        &hook_scope,
                        hooks.on_attach.clone(),
                        state,
                        loop_event_tx.clone(),
                        loop_fail_tx.clone(),
                        false,
                    ),
                    LifecycleState::Starting => launch_hook(
                        &hook_scope,
                        hooks.on_start.clone(),
                        state,
                        loop_event_tx.clone(),
                        loop_fail_tx.clone(),
                        false,
                    ),
                    LifecycleState::Stopping => launch_hook(
                        &hook_scope,
                        hooks.on_stop.clone(),
                        state,
                        loop_event_tx.clone(),
                        loop_fail_tx.clone(),
                        false,
                    ),
                    LifecycleState::Detaching => launch_hook(
                        &hook_scope,
                        hooks.on_detach.clone(),
                        state,
                        loop_event_tx.clone(),
                        loop_fail_tx.clone(),
                        true,
                    ),
                    LifecycleState::Running => {
                        if previous == LifecycleState::Starting {
                            run_post_hook(&hook_scope, hooks.after_start.clone(), "after_start");
                        }
                    }
                    LifecycleState::Stopped => {
                        if previous == LifecycleState::Stopping {
                            run_post_hook(&hook_scope, hooks.after_stop.clone(), "after_stop");
                        }
                    }
                    _ => {}
                }
            }
        });

        Self {
            events: event_tx,
            state: state_rx,
        }
    }

    /// Post an event; FIFO per machine.
    pub fn post(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    /// Current state.
    pub fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    /// Wait until the machine reaches one of `targets`, or time out.
    pub async fn await_state(
        &self,
        targets: &[LifecycleState],
        timeout: Duration,
    ) -> Result<LifecycleState, DeviceError> {
        let mut rx = self.state.clone();
        let wait = async {
            loop {
                let current = *rx.borrow();
                if targets.contains(&current) {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return current;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DeviceError::soft_timeout(timeout))
    }
}

fn lookup(state: LifecycleState, event: &str) -> Option<LifecycleState> {
    LifecycleState::transitions()
        .iter()
        .find(|(from, name, _)| *from == state && *name == event)
        .map(|(_, _, to)| *to)
}

fn launch_hook(
    scope: &DeviceScope,
    hook: Option<LifecycleHook>,
    phase: LifecycleState,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    failures: mpsc::UnboundedSender<LifecycleEvent>,
    always_succeeds: bool,
) {
    scope.spawn(async move {
        let result = match hook {
            Some(hook) => hook().await,
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                let _ = events.send(LifecycleEvent::PhaseComplete(phase));
            }
            Err(err) if always_succeeds => {
                tracing::warn!(phase = %phase, error = %err, "detach hook failed; detaching anyway");
                let _ = events.send(LifecycleEvent::PhaseComplete(phase));
            }
            Err(err) => {
                tracing::warn!(phase = %phase, error = %err, "lifecycle hook failed");
                let _ = failures.send(LifecycleEvent::Fail(err.into()));
            }
        }
    });
}

fn run_post_hook(scope: &DeviceScope, hook: Option<LifecycleHook>, label: &'static str) {
    if let Some(hook) = hook {
        scope.spawn(async move {
            if let Err(err) = hook().await {
                tracing::warn!(hook = label, error = %err, "post-transition hook failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hooks_counting(counter: Arc<AtomicUsize>) -> LifecycleHooks {
        let on_start = counter;
        LifecycleHooks {
            on_start: Some(Arc::new(move || {
                let seen = on_start.clone();
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })),
            ..LifecycleHooks::default()
        }
    }

    #[tokio::test]
    async fn test_attach_start_stop_detach() {
        let scope = DeviceScope::new();
        let fsm = LifecycleFsm::spawn(&scope, "m".into(), LifecycleHooks::default(), None);

        fsm.post(LifecycleEvent::Attach);
        let state = fsm
            .await_state(&[LifecycleState::Stopped], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Stopped);

        fsm.post(LifecycleEvent::Start);
        assert_eq!(
            fsm.await_state(&[LifecycleState::Running], Duration::from_secs(1)).await.unwrap(),
            LifecycleState::Running
        );

        fsm.post(LifecycleEvent::Stop);
        assert_eq!(
            fsm.await_state(&[LifecycleState::Stopped], Duration::from_secs(1)).await.unwrap(),
            LifecycleState::Stopped
        );

        fsm.post(LifecycleEvent::Detach);
        assert_eq!(
            fsm.await_state(&[LifecycleState::Detached], Duration::from_secs(1)).await.unwrap(),
            LifecycleState::Detached
        );
        scope.cancel();
    }

    #[tokio::test]
    async fn test_start_hook_runs_once() {
        let scope = DeviceScope::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let fsm = LifecycleFsm::spawn(&scope, "m".into(), hooks_counting(counter.clone()), None);
        fsm.post(LifecycleEvent::Attach);
        fsm.post(LifecycleEvent::Start);
        fsm.await_state(&[LifecycleState::Running], Duration::from_secs(1)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scope.cancel();
    }

    #[tokio::test]
    async fn test_hook_failure_enters_failed_and_reset_recovers() {
        let scope = DeviceScope::new();
        let hooks = LifecycleHooks {
            on_start: Some(Arc::new(|| {
                Box::pin(async { Err(DeviceError::Internal("boom".into())) })
            })),
            ..LifecycleHooks::default()
        };
        let fsm = LifecycleFsm::spawn(&scope, "m".into(), hooks, None);
        fsm.post(LifecycleEvent::Attach);
        fsm.await_state(&[LifecycleState::Stopped], Duration::from_secs(1)).await.unwrap();
        fsm.post(LifecycleEvent::Start);
        assert_eq!(
            fsm.await_state(&[LifecycleState::Failed], Duration::from_secs(1)).await.unwrap(),
            LifecycleState::Failed
        );
        fsm.post(LifecycleEvent::Reset);
        assert_eq!(
            fsm.await_state(&[LifecycleState::Stopped], Duration::from_secs(1)).await.unwrap(),
            LifecycleState::Stopped
        );
        scope.cancel();
    }

    #[tokio::test]
    async fn test_incompatible_event_is_dropped() {
        let scope = DeviceScope::new();
        let fsm = LifecycleFsm::spawn(&scope, "m".into(), LifecycleHooks::default(), None);
        // Start before Attach has no transition from Detached
        fsm.post(LifecycleEvent::Start);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fsm.current(), LifecycleState::Detached);
        scope.cancel();
    }

    #[tokio::test]
    async fn test_detach_hook_failure_still_detaches() {
        let scope = DeviceScope::new();
        let hooks = LifecycleHooks {
            on_detach: Some(Arc::new(|| {
                Box::pin(async { Err(DeviceError::Internal("io".into())) })
            })),
            ..LifecycleHooks::default()
        };
        let fsm = LifecycleFsm::spawn(&scope, "m".into(), hooks, None);
        fsm.post(LifecycleEvent::Attach);
        fsm.await_state(&[LifecycleState::Stopped], Duration::from_secs(1)).await.unwrap();
        fsm.post(LifecycleEvent::Detach);
        assert_eq!(
            fsm.await_state(&[LifecycleState::Detached], Duration::from_secs(1)).await.unwrap(),
            LifecycleState::Detached
        );
        scope.cancel();
    }
}

//! Operational guards
//!
//! Guards watch the state graph and post events into the operational
//! machine when a condition is sustained. The serializable half of a
//! guard lives in the blueprint's feature map; the code half (window
//! predicates) is registered as a behavior facet.

use super::operational::OperationalFsm;
use crate::runtime::scope::DeviceScope;
use crate::state::{DeviceState, StateValue};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Serializable guard declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GuardSpec {
    /// Fires `post_event` once the predicate has been continuously true
    /// for `duration` while the machine is in one of `from_states`
    /// (anywhere when `None`).
    TimedPredicate {
        name: String,
        predicate: crate::meta::Name,
        duration: Duration,
        post_event: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        from_states: Option<Vec<String>>,
    },
    /// Fires `post_event` when the registered window predicate holds over
    /// the last `window` readings of the property.
    ValueChange {
        name: String,
        property: crate::meta::Name,
        window: usize,
        post_event: String,
    },
}

impl GuardSpec {
    /// Guard name, unique within a blueprint.
    pub fn name(&self) -> &str {
        match self {
            GuardSpec::TimedPredicate { name, .. } | GuardSpec::ValueChange { name, .. } => name,
        }
    }

    /// Event the guard posts.
    pub fn post_event(&self) -> &str {
        match self {
            GuardSpec::TimedPredicate { post_event, .. }
            | GuardSpec::ValueChange { post_event, .. } => post_event,
        }
    }

    /// Property the guard observes.
    pub fn observed(&self) -> &crate::meta::Name {
        match self {
            GuardSpec::TimedPredicate { predicate, .. } => predicate,
            GuardSpec::ValueChange { property, .. } => property,
        }
    }
}

/// Code half of a [`GuardSpec::ValueChange`]: decides over the window of
/// recent readings.
pub type WindowPredicate = Arc<dyn Fn(&[StateValue<crate::meta::Meta>]) -> bool + Send + Sync>;

/// Watch a boolean predicate and post once it has been continuously true
/// for `duration` while the machine is in an allowed state.
pub fn spawn_timed_predicate_guard(
    scope: &DeviceScope,
    predicate: DeviceState<bool>,
    duration: Duration,
    post_event: String,
    from_states: Option<Vec<String>>,
    fsm: OperationalFsm,
) {
    let mut readings = predicate.subscribe();
    scope.spawn(async move {
        loop {
            // wait for a rising edge
            while !readings.borrow().value.unwrap_or(false) {
                if readings.changed().await.is_err() {
                    return;
                }
            }
            // hold for the full duration; any falling edge re-arms
            let fired = tokio::select! {
                _ = tokio::time::sleep(duration) => true,
                changed = wait_for_false(&mut readings) => {
                    if changed { false } else { return }
                }
            };
            if fired && readings.borrow().value.unwrap_or(false) {
                let state_ok = from_states
                    .as_ref()
                    .map(|allowed| allowed.contains(&fsm.current()))
                    .unwrap_or(true);
                if !state_ok {
                    // predicate holds but the machine is elsewhere;
                    // re-evaluate after another period
                    continue;
                }
                tracing::debug!(event = %post_event, "timed predicate guard fired");
                fsm.post(post_event.clone());
                // wait for the falling edge before re-arming
                if !wait_for_false(&mut readings).await {
                    return;
                }
            }
        }
    });
}

/// Resolves true on a falling edge, false when the channel closed.
async fn wait_for_false(
    readings: &mut tokio::sync::watch::Receiver<StateValue<bool>>,
) -> bool {
    loop {
        if readings.changed().await.is_err() {
            return false;
        }
        if !readings.borrow().value.unwrap_or(false) {
            return true;
        }
    }
}

/// Watch a property and post whenever the window predicate holds over the
/// last `window` readings.
pub fn spawn_value_change_guard(
    scope: &DeviceScope,
    property: DeviceState<crate::meta::Meta>,
    window: usize,
    predicate: WindowPredicate,
    post_event: String,
    fsm: OperationalFsm,
) {
    let mut readings = property.subscribe();
    scope.spawn(async move {
        let mut recent: VecDeque<StateValue<crate::meta::Meta>> =
            VecDeque::with_capacity(window.max(1));
        while readings.changed().await.is_ok() {
            let reading = readings.borrow().clone();
            if recent.len() == window.max(1) {
                recent.pop_front();
            }
            recent.push_back(reading);
            let slice: Vec<StateValue<crate::meta::Meta>> = recent.iter().cloned().collect();
            if predicate(&slice) {
                tracing::debug!(event = %post_event, "value change guard fired");
                fsm.post(post_event.clone());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::operational::{FsmDescriptor, OperationalCallbacks};
    use crate::meta::Meta;
    use crate::state::MutableDeviceState;

    fn fsm(scope: &DeviceScope) -> OperationalFsm {
        let descriptor = FsmDescriptor::new("Idle")
            .transition("Idle", "Ready", "Armed")
            .transition("Idle", "Spike", "Tripped");
        OperationalFsm::spawn(scope, "m".into(), descriptor, OperationalCallbacks::new())
    }

    #[tokio::test]
    async fn test_timed_guard_fires_after_sustained_true() {
        let scope = DeviceScope::new();
        let fsm = fsm(&scope);
        let predicate = MutableDeviceState::new(Some(false));
        spawn_timed_predicate_guard(
            &scope,
            predicate.state(),
            Duration::from_millis(30),
            "Ready".into(),
            None,
            fsm.clone(),
        );
        predicate.update(true);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fsm.current(), "Armed");
        scope.cancel();
    }

    #[tokio::test]
    async fn test_timed_guard_rearms_on_falling_edge() {
        let scope = DeviceScope::new();
        let fsm = fsm(&scope);
        let predicate = MutableDeviceState::new(Some(false));
        spawn_timed_predicate_guard(
            &scope,
            predicate.state(),
            Duration::from_millis(60),
            "Ready".into(),
            None,
            fsm.clone(),
        );
        predicate.update(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        predicate.update(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fsm.current(), "Idle");
        scope.cancel();
    }

    #[tokio::test]
    async fn test_timed_guard_respects_from_states() {
        let scope = DeviceScope::new();
        let fsm = fsm(&scope);
        let predicate = MutableDeviceState::new(Some(true));
        spawn_timed_predicate_guard(
            &scope,
            predicate.state(),
            Duration::from_millis(20),
            "Ready".into(),
            Some(vec!["Cycling".into()]), // never the current state
            fsm.clone(),
        );
        predicate.update(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fsm.current(), "Idle");
        scope.cancel();
    }

    #[tokio::test]
    async fn test_value_change_guard() {
        let scope = DeviceScope::new();
        let fsm = fsm(&scope);
        let property = MutableDeviceState::new(Some(Meta::of(0.0)));
        let predicate: WindowPredicate = Arc::new(|window| {
            window
                .iter()
                .filter_map(|sv| sv.value.as_ref())
                .filter_map(|m| m.value().and_then(crate::meta::Value::as_f64))
                .any(|v| v > 10.0)
        });
        spawn_value_change_guard(
            &scope,
            property.state(),
            3,
            predicate,
            "Spike".into(),
            fsm.clone(),
        );
        property.update(Meta::of(2.0));
        property.update(Meta::of(12.5));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fsm.current(), "Tripped");
        scope.cancel();
    }
}

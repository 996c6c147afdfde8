//! Plan execution
//!
//! The executor walks an [`ActionSpec`] tree against a hub. `Sequence` is
//! strict; `Parallel` waits for every branch and reports an aggregate
//! failure; `AwaitPredicate` polls a reactive predicate cell under a
//! timeout. Cancellation is cooperative: dropping the execution future
//! (or cancelling the caller's scope) aborts at the next await point.

use super::refs::ReferenceResolver;
use super::{ActionSpec, TransactionPlan};
use crate::error::{DeviceError, SerializableDeviceFailure};
use crate::hub::{DeviceHub, ExecutionContext};
use crate::meta::{Meta, Value};
use crate::ports::{SignalPort, WorkspaceTaskRunner};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Variable bindings and environment of one plan run.
pub struct PlanExecutionContext {
    /// Caller identity the plan runs under.
    pub ctx: ExecutionContext,
    /// Variable and result bindings.
    pub variables: Mutex<HashMap<String, Meta>>,
}

impl PlanExecutionContext {
    /// Fresh context for a principal.
    pub fn new(ctx: ExecutionContext) -> Self {
        Self {
            ctx,
            variables: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-bind a variable.
    pub async fn bind(&self, key: impl Into<String>, value: Meta) {
        self.variables.lock().await.insert(key.into(), value);
    }

    /// Read a binding back after the run.
    pub async fn get(&self, key: &str) -> Option<Meta> {
        self.variables.lock().await.get(key).cloned()
    }
}

/// Executes transaction plans against one hub.
pub struct PlanExecutor {
    hub: DeviceHub,
    resolver: ReferenceResolver,
    tasks: Option<Arc<dyn WorkspaceTaskRunner>>,
    signals: Option<Arc<dyn SignalPort>>,
}

impl PlanExecutor {
    /// Executor over a hub with its reference resolver.
    pub fn new(hub: DeviceHub, resolver: ReferenceResolver) -> Self {
        Self {
            hub,
            resolver,
            tasks: None,
            signals: None,
        }
    }

    /// Enable `RunWorkspaceTask` steps.
    pub fn with_task_runner(mut self, tasks: Arc<dyn WorkspaceTaskRunner>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Enable `AwaitSignal` steps.
    pub fn with_signals(mut self, signals: Arc<dyn SignalPort>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Run a plan to completion. The first failure bubbles up;
    /// `Parallel` branches collect into one aggregate failure.
    pub async fn execute(
        &self,
        plan: &TransactionPlan,
        pctx: &PlanExecutionContext,
    ) -> Result<(), SerializableDeviceFailure> {
        tracing::info!(plan = %plan.name, "executing plan");
        let outcome = self.run(&plan.root, pctx).await;
        if let Err(err) = &outcome {
            tracing::warn!(plan = %plan.name, error = %err, "plan failed");
        }
        outcome
    }

    fn run<'a>(
        &'a self,
        spec: &'a ActionSpec,
        pctx: &'a PlanExecutionContext,
    ) -> BoxFuture<'a, Result<(), SerializableDeviceFailure>> {
        Box::pin(async move {
            match spec {
                ActionSpec::Attach {
                    device,
                    blueprint,
                    config,
                } => {
                    let config = self.hydrate(config, pctx).await?;
                    self.hub
                        .attach(&pctx.ctx, device.clone(), blueprint.clone(), config)
                        .await
                }
                ActionSpec::Detach { device } => {
                    self.hub.detach(&pctx.ctx, device.clone()).await
                }
                ActionSpec::Start { device } => self.hub.start(&pctx.ctx, device.clone()).await,
                ActionSpec::Stop { device } => self.hub.stop(&pctx.ctx, device.clone()).await,
                ActionSpec::WriteProperty {
                    address,
                    property,
                    value,
                } => {
                    let value = self.hydrate(value, pctx).await?;
                    let device = self.hub.find_device(address).await?;
                    device.write(property, value).await.map_err(Into::into)
                }
                ActionSpec::Invoke {
                    address,
                    action,
                    input,
                    result_key,
                } => {
                    let input = self.hydrate(input, pctx).await?;
                    let device = self.hub.find_device(address).await?;
                    let result = device.execute(action, input).await.map_err(SerializableDeviceFailure::from)?;
                    if let Some(key) = result_key {
                        pctx.variables.lock().await.insert(key.clone(), result);
                    }
                    Ok(())
                }
                ActionSpec::Sequence { steps } => {
                    for step in steps {
                        self.run(step, pctx).await?;
                    }
                    Ok(())
                }
                ActionSpec::Parallel { steps } => {
                    let branches = steps.iter().map(|step| self.run(step, pctx));
                    let outcomes = futures::future::join_all(branches).await;
                    let failures: Vec<String> = outcomes
                        .into_iter()
                        .filter_map(Result::err)
                        .map(|err| err.to_string())
                        .collect();
                    if failures.is_empty() {
                        Ok(())
                    } else {
                        Err(DeviceError::Transaction {
                            message: format!(
                                "{} of {} parallel steps failed: {}",
                                failures.len(),
                                steps.len(),
                                failures.join("; ")
                            ),
                            rolled_back: vec![],
                        }
                        .into())
                    }
                }
                ActionSpec::Delay { duration } => {
                    tokio::time::sleep(*duration).await;
                    Ok(())
                }
                ActionSpec::AwaitPredicate {
                    address,
                    predicate,
                    timeout,
                } => {
                    let device = self.hub.find_device(address).await?;
                    let cell = device.property_state_of(predicate).ok_or_else(|| {
                        SerializableDeviceFailure::from(DeviceError::not_found(
                            "predicate", predicate,
                        ))
                    })?;
                    let mut readings = cell.subscribe();
                    let wait = async {
                        loop {
                            let holds = readings
                                .borrow()
                                .value
                                .as_ref()
                                .and_then(|m| m.value())
                                .and_then(Value::as_bool)
                                .unwrap_or(false);
                            if holds {
                                return;
                            }
                            if readings.changed().await.is_err() {
                                // source gone; wait out the timeout
                                futures::future::pending::<()>().await;
                            }
                        }
                    };
                    tokio::time::timeout(*timeout, wait)
                        .await
                        .map_err(|_| DeviceError::soft_timeout(*timeout).into())
                }
                ActionSpec::AwaitSignal { id, prompt } => {
                    let signals = self.signals.as_ref().ok_or_else(|| {
                        SerializableDeviceFailure::from(DeviceError::not_found("signal port", id))
                    })?;
                    signals.await_signal(id, prompt).await.map_err(Into::into)
                }
                ActionSpec::Conditional {
                    address,
                    predicate,
                    then,
                    otherwise,
                } => {
                    let device = self.hub.find_device(address).await?;
                    let reading = device
                        .read_state(predicate)
                        .await
                        .map_err(SerializableDeviceFailure::from)?;
                    let holds = reading
                        .value
                        .as_ref()
                        .and_then(|m| m.value())
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if holds {
                        self.run(then, pctx).await
                    } else if let Some(otherwise) = otherwise {
                        self.run(otherwise, pctx).await
                    } else {
                        Ok(())
                    }
                }
                ActionSpec::Loop {
                    collection,
                    var,
                    body,
                } => {
                    let template = Meta::of(collection.as_str());
                    let resolved = self.hydrate(&template, pctx).await?;
                    for element in collection_elements(&resolved) {
                        pctx.variables.lock().await.insert(var.clone(), element);
                        self.run(body, pctx).await?;
                    }
                    Ok(())
                }
                ActionSpec::RunWorkspaceTask {
                    task_id,
                    input,
                    result_key,
                } => {
                    let tasks = self.tasks.as_ref().ok_or_else(|| {
                        SerializableDeviceFailure::from(DeviceError::not_found(
                            "workspace task runner",
                            task_id,
                        ))
                    })?;
                    let input = self.hydrate(input, pctx).await?;
                    let result = tasks
                        .run_task(task_id, input)
                        .await
                        .map_err(SerializableDeviceFailure::from)?;
                    if let Some(key) = result_key {
                        pctx.variables.lock().await.insert(key.clone(), result);
                    }
                    Ok(())
                }
            }
        })
    }

    async fn hydrate(
        &self,
        meta: &Meta,
        pctx: &PlanExecutionContext,
    ) -> Result<Meta, SerializableDeviceFailure> {
        self.resolver
            .hydrate(meta, &pctx.variables)
            .await
            .map_err(Into::into)
    }
}

/// Elements of a resolved collection: list scalars, or child nodes under
/// any key, in order.
fn collection_elements(meta: &Meta) -> Vec<Meta> {
    if let Some(Value::List(values)) = meta.value() {
        return values.iter().map(|v| Meta::of(v.clone())).collect();
    }
    meta.items()
        .values()
        .flat_map(|nodes| nodes.iter().cloned())
        .collect()
}

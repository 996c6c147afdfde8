//! Child property bindings
//!
//! A parent blueprint can drive properties of its children: a constant
//! written once at attach, a direct forward from a parent property, or a
//! forward through a transformer. Forwarders live in the child's scope,
//! so they die with the child.

use super::Device;
use crate::blueprint::{ChildPropertyBinding, DeviceApi, TransformerDescriptor};
use crate::error::DeviceError;
use crate::meta::{Meta, Value};

/// Apply one transformer descriptor to a value.
pub fn apply_transformer(
    parent: &Device,
    transformer: &TransformerDescriptor,
    value: &Meta,
) -> Result<Meta, DeviceError> {
    match transformer {
        TransformerDescriptor::Linear { scale, offset } => {
            let number = value
                .value()
                .and_then(Value::as_f64)
                .ok_or_else(|| DeviceError::Validation(
                    "linear transformer requires a numeric value".into(),
                ))?;
            Ok(Meta::of(scale * number + offset))
        }
        TransformerDescriptor::Map { entries } => {
            let text = value.value().and_then(Value::as_str);
            match text.and_then(|t| entries.get(t)) {
                Some(mapped) => Ok(Meta::of(mapped.as_str())),
                None => Ok(value.clone()),
            }
        }
        TransformerDescriptor::Custom { key } => {
            let transformer = parent
                .blueprint()
                .behavior
                .transformers
                .get(key)
                .cloned()
                .ok_or_else(|| DeviceError::not_found("binding transformer", key))?;
            Ok(transformer(value))
        }
    }
}

/// Wire the declared bindings from a parent onto a freshly attached
/// child.
pub fn apply_bindings(
    parent: &Device,
    child: &Device,
    bindings: &[ChildPropertyBinding],
) -> Result<(), DeviceError> {
    for binding in bindings {
        match binding {
            ChildPropertyBinding::Const { target, value } => {
                child.update_property(target, value.clone())?;
            }
            ChildPropertyBinding::Direct { target, source } => {
                let cell = parent
                    .property_state(source)
                    .ok_or_else(|| DeviceError::not_found("binding source", source))?;
                let mut readings = cell.subscribe();
                let child = child.clone();
                let target = target.clone();
                // seed once, then forward every change
                let seed = readings.borrow().clone();
                if let Some(value) = seed.value {
                    child.update_property(&target, value)?;
                }
                let forward_child = child.clone();
                child.scope().spawn(async move {
                    while readings.changed().await.is_ok() {
                        let reading = readings.borrow().clone();
                        if let Some(value) = reading.value {
                            if let Err(err) = forward_child.update_property(&target, value) {
                                tracing::warn!(target = %target, error = %err, "binding forward failed");
                            }
                        }
                    }
                });
            }
            ChildPropertyBinding::Transformed {
                target,
                source,
                transformer,
            } => {
                let cell = parent
                    .property_state(source)
                    .ok_or_else(|| DeviceError::not_found("binding source", source))?;
                let mut readings = cell.subscribe();
                let seed = readings.borrow().clone();
                if let Some(value) = seed.value {
                    let transformed = apply_transformer(parent, transformer, &value)?;
                    child.update_property(target, transformed)?;
                }
                let forward_parent = parent.clone();
                let forward_child = child.clone();
                let target = target.clone();
                let transformer = transformer.clone();
                child.scope().spawn(async move {
                    while readings.changed().await.is_ok() {
                        let reading = readings.borrow().clone();
                        let Some(value) = reading.value else { continue };
                        match apply_transformer(&forward_parent, &transformer, &value) {
                            Ok(transformed) => {
                                if let Err(err) =
                                    forward_child.update_property(&target, transformed)
                                {
                                    tracing::warn!(target = %target, error = %err, "binding forward failed");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(target = %target, error = %err, "binding transform failed");
                            }
                        }
                    }
                });
            }
        }
    }
    Ok(())
}

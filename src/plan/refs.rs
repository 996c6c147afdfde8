//! Reference hydration
//!
//! String values inside plan metas may carry `${...}` templates resolved
//! lazily against the execution context right before a step runs:
//!
//! - `${var:name}`: context variable
//! - `${result:key}`: stored step result
//! - `${prop:route::device:property}`: live property read
//! - `${secret:reference}`: secret provider lookup
//!
//! Hydration is recursive: a resolved value may itself contain templates,
//! bounded by a fixed depth to keep cycles from running away.

use crate::error::DeviceError;
use crate::hub::DeviceHub;
use crate::meta::{Meta, Value};
use crate::ports::SecretProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_HYDRATION_DEPTH: usize = 8;

/// Resolves `${...}` references against the live environment.
pub struct ReferenceResolver {
    hub: DeviceHub,
    secrets: Option<Arc<dyn SecretProvider>>,
}

impl ReferenceResolver {
    /// Resolver over a hub, optionally with secrets.
    pub fn new(hub: DeviceHub, secrets: Option<Arc<dyn SecretProvider>>) -> Self {
        Self { hub, secrets }
    }

    /// Hydrate a whole meta tree: every string scalar is template-expanded.
    pub async fn hydrate(
        &self,
        meta: &Meta,
        variables: &Mutex<HashMap<String, Meta>>,
    ) -> Result<Meta, DeviceError> {
        self.hydrate_at_depth(meta, variables, 0).await
    }

    fn hydrate_at_depth<'a>(
        &'a self,
        meta: &'a Meta,
        variables: &'a Mutex<HashMap<String, Meta>>,
        depth: usize,
    ) -> futures::future::BoxFuture<'a, Result<Meta, DeviceError>> {
        Box::pin(async move {
            if depth > MAX_HYDRATION_DEPTH {
                return Err(DeviceError::Validation(
                    "reference hydration exceeded maximum depth".into(),
                ));
            }
            let mut out = Meta::new();
            if let Some(value) = meta.value() {
                match value {
                    Value::String(text) if is_template(text) => {
                        let resolved = self.resolve_template(text, variables).await?;
                        // a resolved value may itself carry templates
                        let resolved =
                            self.hydrate_at_depth(&resolved, variables, depth + 1).await?;
                        if let Some(v) = resolved.value() {
                            out.set_own_value(v.clone())?;
                        }
                        for (key, nodes) in resolved.items() {
                            for node in nodes {
                                out.append(key, node.clone())?;
                            }
                        }
                    }
                    other => out.set_own_value(other.clone())?,
                }
            }
            for (key, nodes) in meta.items() {
                for node in nodes {
                    let hydrated = self.hydrate_at_depth(node, variables, depth + 1).await?;
                    out.append(key, hydrated)?;
                }
            }
            Ok(out)
        })
    }

    async fn resolve_template(
        &self,
        text: &str,
        variables: &Mutex<HashMap<String, Meta>>,
    ) -> Result<Meta, DeviceError> {
        let inner = &text[2..text.len() - 1];
        let (kind, rest) = inner
            .split_once(':')
            .ok_or_else(|| DeviceError::Validation(format!("malformed reference '{text}'")))?;
        match kind {
            "var" | "result" => {
                let variables = variables.lock().await;
                variables
                    .get(rest)
                    .cloned()
                    .ok_or_else(|| DeviceError::not_found("plan variable", rest))
            }
            "prop" => {
                let (address_text, property) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| DeviceError::Validation(format!("malformed property reference '{text}'")))?;
                let address = address_text
                    .parse()
                    .map_err(|e: crate::meta::AddressError| DeviceError::Validation(e.to_string()))?;
                let device = self
                    .hub
                    .find_device(&address)
                    .await
                    .map_err(|f| DeviceError::Validation(f.to_string()))?;
                let reading = device.read_state(&property.parse()?).await?;
                Ok(reading.value.unwrap_or_default())
            }
            "secret" => {
                let provider = self
                    .secrets
                    .as_ref()
                    .ok_or_else(|| DeviceError::not_found("secret provider", rest))?;
                let secret = provider
                    .resolve(rest)
                    .await?
                    .ok_or_else(|| DeviceError::not_found("secret", rest))?;
                Ok(Meta::of(secret.as_str()))
            }
            other => Err(DeviceError::Validation(format!(
                "unknown reference kind '{other}' in '{text}'"
            ))),
        }
    }
}

fn is_template(text: &str) -> bool {
    text.starts_with("${") && text.ends_with('}')
}

//! # Meta Tree
//!
//! [`Meta`] is the self-describing nested value tree used as the universal
//! data carrier of the control plane: configuration, action arguments,
//! property values and serialized events all travel as meta. A node holds
//! an optional scalar [`Value`] plus an ordered map from token text to a
//! list of child nodes.
//!
//! Meta trees are plain values. Mutation happens on unsealed trees only;
//! [`Meta::seal`] freezes a tree for sharing. [`ObservableMeta`] wraps a
//! tree and emits the path of every change.

pub mod address;
pub mod convert;
pub mod name;

pub use address::{Address, AddressError};
pub use convert::{
    BoolConverter, ConvertError, DoubleConverter, EnumConverter, IntConverter, LongConverter,
    MetaConverter, MetaIdentityConverter, SerdeConverter, StringConverter,
};
pub use name::{Name, NameError, NameToken};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors produced by meta-tree operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetaError {
    #[error("meta is sealed and cannot be modified")]
    Sealed,

    #[error("no node at '{0}'")]
    NoSuchNode(Name),

    #[error("meta text is not valid: {0}")]
    Parse(String),
}

/// Tagged scalar payload of a meta node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Double-precision float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Homogeneous or mixed list of scalars.
    List(Vec<Value>),
    /// Enum constant carried as its serial name.
    Enum(String),
}

impl Value {
    /// Read as bool, if the payload is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read as i64, coercing from `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(i64::from(*i)),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    /// Read as f64, coercing from the integer variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(f64::from(*i)),
            Value::Long(l) => Some(*l as f64),
            _ => None,
        }
    }

    /// Read as string slice for `String` and `Enum` payloads.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Read as list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Whether this is the explicit null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Recursive, self-describing value tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    /// Optional scalar payload of this node.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    value: Option<Value>,

    /// Children keyed by token text, each key holding an ordered list.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    items: BTreeMap<String, Vec<Meta>>,

    #[serde(skip, default)]
    sealed: bool,
}

/// Structural equality; the seal flag is not part of the value.
impl PartialEq for Meta {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.items == other.items
    }
}

impl Meta {
    /// Empty, unsealed node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaf node holding a scalar.
    pub fn of(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            items: BTreeMap::new(),
            sealed: false,
        }
    }

    /// Scalar payload of this node.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Whether the node has neither value nor children.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.items.is_empty()
    }

    /// Children keyed by token text.
    pub fn items(&self) -> &BTreeMap<String, Vec<Meta>> {
        &self.items
    }

    /// First child node under the token, if present.
    pub fn item(&self, token: &str) -> Option<&Meta> {
        self.items.get(token).and_then(|nodes| nodes.first())
    }

    /// Descend along a name, taking the first node at each step.
    pub fn get(&self, name: &Name) -> Option<&Meta> {
        let mut node = self;
        for token in name.tokens() {
            node = node.item(&token.to_string())?;
        }
        Some(node)
    }

    /// Scalar value at a path.
    pub fn get_value(&self, name: &Name) -> Option<&Value> {
        self.get(name).and_then(Meta::value)
    }

    /// Replace the scalar payload of this node.
    pub fn set_own_value(&mut self, value: impl Into<Value>) -> Result<(), MetaError> {
        if self.sealed {
            return Err(MetaError::Sealed);
        }
        self.value = Some(value.into());
        Ok(())
    }

    /// Set (or create) the node at a path.
    pub fn set(&mut self, name: &Name, node: Meta) -> Result<(), MetaError> {
        if self.sealed {
            return Err(MetaError::Sealed);
        }
        match name.tokens().split_first() {
            None => {
                self.value = node.value;
                self.items = node.items;
                Ok(())
            }
            Some((head, rest)) => {
                let key = head.to_string();
                let slot = self.items.entry(key).or_insert_with(|| vec![Meta::new()]);
                if slot.is_empty() {
                    slot.push(Meta::new());
                }
                slot[0].set(&Name::from_tokens(rest.iter().cloned()), node)
            }
        }
    }

    /// Set a scalar at a path.
    pub fn set_value(&mut self, name: &Name, value: impl Into<Value>) -> Result<(), MetaError> {
        self.set(name, Meta::of(value))
    }

    /// Append an additional child node under a token.
    pub fn append(&mut self, token: &str, node: Meta) -> Result<(), MetaError> {
        if self.sealed {
            return Err(MetaError::Sealed);
        }
        self.items.entry(token.to_string()).or_default().push(node);
        Ok(())
    }

    /// Tree-merge `other` into `self`.
    ///
    /// Scalar payloads from `other` overwrite. Children merge per key: when
    /// both sides hold exactly one node under a key the nodes merge
    /// recursively, otherwise the incoming list replaces the existing one.
    pub fn merge(&mut self, other: &Meta) -> Result<(), MetaError> {
        if self.sealed {
            return Err(MetaError::Sealed);
        }
        if other.value.is_some() {
            self.value = other.value.clone();
        }
        for (key, incoming) in &other.items {
            match self.items.get_mut(key) {
                Some(existing) if existing.len() == 1 && incoming.len() == 1 => {
                    existing[0].merge(&incoming[0])?;
                }
                _ => {
                    self.items.insert(key.clone(), incoming.clone());
                }
            }
        }
        Ok(())
    }

    /// Layered copy: `self` overlaid on top of `base`.
    pub fn layered_on(&self, base: &Meta) -> Meta {
        let mut out = base.unsealed();
        // merge cannot fail on an unsealed tree
        let _ = out.merge(self);
        out
    }

    /// Deep copy with every seal flag cleared.
    pub fn unsealed(&self) -> Meta {
        let mut out = self.clone();
        out.clear_seal();
        out
    }

    fn clear_seal(&mut self) {
        self.sealed = false;
        for nodes in self.items.values_mut() {
            for node in nodes {
                node.clear_seal();
            }
        }
    }

    /// Freeze this tree and every descendant.
    pub fn seal(&mut self) {
        self.sealed = true;
        for nodes in self.items.values_mut() {
            for node in nodes {
                node.seal();
            }
        }
    }

    /// Whether this node is frozen.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Canonical textual form (JSON).
    pub fn print(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the canonical textual form.
    pub fn parse(text: &str) -> Result<Meta, MetaError> {
        serde_json::from_str(text).map_err(|e| MetaError::Parse(e.to_string()))
    }
}

impl From<Value> for Meta {
    fn from(value: Value) -> Self {
        Meta::of(value)
    }
}

/// A shared meta tree that emits the path of every change.
#[derive(Clone)]
pub struct ObservableMeta {
    inner: Arc<RwLock<Meta>>,
    changes: broadcast::Sender<Name>,
}

impl ObservableMeta {
    /// Wrap an initial tree.
    pub fn new(initial: Meta) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(initial)),
            changes,
        }
    }

    /// Copy of the current tree.
    pub fn snapshot(&self) -> Meta {
        self.inner.read().expect("meta lock poisoned").clone()
    }

    /// Set the node at a path and notify subscribers.
    pub fn set(&self, name: &Name, node: Meta) -> Result<(), MetaError> {
        {
            let mut guard = self.inner.write().expect("meta lock poisoned");
            guard.set(name, node)?;
        }
        let _ = self.changes.send(name.clone());
        Ok(())
    }

    /// Set a scalar at a path and notify subscribers.
    pub fn set_value(&self, name: &Name, value: impl Into<Value>) -> Result<(), MetaError> {
        self.set(name, Meta::of(value))
    }

    /// Subscribe to changed paths.
    pub fn subscribe(&self) -> broadcast::Receiver<Name> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> Name {
        Name::parse(text).unwrap()
    }

    #[test]
    fn test_scalar_paths() {
        let mut meta = Meta::new();
        meta.set_value(&name("motor.position"), 0.5).unwrap();
        meta.set_value(&name("motor.enabled"), true).unwrap();
        assert_eq!(meta.get_value(&name("motor.position")).unwrap().as_f64(), Some(0.5));
        assert_eq!(meta.get_value(&name("motor.enabled")).unwrap().as_bool(), Some(true));
        assert!(meta.get(&name("motor.missing")).is_none());
    }

    #[test]
    fn test_merge_overwrites_scalars() {
        let mut base = Meta::new();
        base.set_value(&name("a.x"), 1i64).unwrap();
        base.set_value(&name("a.y"), 2i64).unwrap();

        let mut overlay = Meta::new();
        overlay.set_value(&name("a.x"), 10i64).unwrap();
        overlay.set_value(&name("b"), "new").unwrap();

        base.merge(&overlay).unwrap();
        assert_eq!(base.get_value(&name("a.x")).unwrap().as_i64(), Some(10));
        assert_eq!(base.get_value(&name("a.y")).unwrap().as_i64(), Some(2));
        assert_eq!(base.get_value(&name("b")).unwrap().as_str(), Some("new"));
    }

    #[test]
    fn test_layering_order() {
        let mut defaults = Meta::new();
        defaults.set_value(&name("rate"), 10i64).unwrap();
        defaults.set_value(&name("mode"), "slow").unwrap();

        let mut config = Meta::new();
        config.set_value(&name("mode"), "fast").unwrap();

        let layered = config.layered_on(&defaults);
        assert_eq!(layered.get_value(&name("rate")).unwrap().as_i64(), Some(10));
        assert_eq!(layered.get_value(&name("mode")).unwrap().as_str(), Some("fast"));
    }

    #[test]
    fn test_sealed_rejects_mutation() {
        let mut meta = Meta::new();
        meta.set_value(&name("x"), 1i64).unwrap();
        meta.seal();
        assert_eq!(meta.set_value(&name("x"), 2i64), Err(MetaError::Sealed));
        assert_eq!(meta.merge(&Meta::of(1i64)), Err(MetaError::Sealed));
    }

    #[test]
    fn test_print_parse_round_trip() {
        let mut meta = Meta::new();
        meta.set_value(&name("motor.position"), 0.5).unwrap();
        meta.set_value(&name("motor.label"), "axis one").unwrap();
        meta.set_value(&name("flags"), Value::List(vec![Value::Bool(true), Value::Int(3)]))
            .unwrap();
        meta.seal();
        let parsed = Meta::parse(&meta.print()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_value_discriminator_on_wire() {
        let json = serde_json::to_string(&Value::Double(0.5)).unwrap();
        assert!(json.contains("\"type\":\"Double\""));
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Double(0.5));
    }

    #[test]
    fn test_append_keeps_order() {
        let mut meta = Meta::new();
        meta.append("entry", Meta::of(1i64)).unwrap();
        meta.append("entry", Meta::of(2i64)).unwrap();
        let values: Vec<i64> = meta.items()["entry"]
            .iter()
            .filter_map(|m| m.value().and_then(Value::as_i64))
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_observable_meta_emits_paths() {
        let observable = ObservableMeta::new(Meta::new());
        let mut changes = observable.subscribe();
        observable.set_value(&name("m.position"), 0.25).unwrap();
        let changed = changes.recv().await.unwrap();
        assert_eq!(changed, name("m.position"));
        assert_eq!(
            observable.snapshot().get_value(&name("m.position")).unwrap().as_f64(),
            Some(0.25)
        );
    }
}

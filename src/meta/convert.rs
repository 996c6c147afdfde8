//! Typed ↔ meta conversion
//!
//! A [`MetaConverter`] is a pure pair of functions between a Rust type and
//! its meta representation. Converters back stateful-property persistence,
//! typed property facades and plan argument hydration. For representable
//! values `from_meta(to_meta(x)) == x` holds.

use super::{Meta, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::str::FromStr;
use thiserror::Error;

/// Conversion failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvertError {
    #[error("expected {expected}, got {found}")]
    WrongShape { expected: &'static str, found: String },

    #[error("unknown enum constant '{0}'")]
    UnknownConstant(String),

    #[error("record conversion failed: {0}")]
    Record(String),
}

/// Pure conversion pair between `T` and [`Meta`].
pub trait MetaConverter<T>: Send + Sync {
    /// Serial name of the value type, used in descriptors.
    fn type_name(&self) -> &str;

    /// Convert a value into its meta form.
    fn to_meta(&self, value: &T) -> Meta;

    /// Read a value back from meta.
    fn from_meta(&self, meta: &Meta) -> Result<T, ConvertError>;
}

fn found(meta: &Meta) -> String {
    match meta.value() {
        Some(value) => format!("{value:?}"),
        None => "node without value".to_string(),
    }
}

/// Converter for booleans.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolConverter;

impl MetaConverter<bool> for BoolConverter {
    fn type_name(&self) -> &str {
        "bool"
    }

    fn to_meta(&self, value: &bool) -> Meta {
        Meta::of(*value)
    }

    fn from_meta(&self, meta: &Meta) -> Result<bool, ConvertError> {
        meta.value()
            .and_then(Value::as_bool)
            .ok_or_else(|| ConvertError::WrongShape { expected: "bool", found: found(meta) })
    }
}

/// Converter for 32-bit integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntConverter;

impl MetaConverter<i32> for IntConverter {
    fn type_name(&self) -> &str {
        "int"
    }

    fn to_meta(&self, value: &i32) -> Meta {
        Meta::of(*value)
    }

    fn from_meta(&self, meta: &Meta) -> Result<i32, ConvertError> {
        meta.value()
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| ConvertError::WrongShape { expected: "int", found: found(meta) })
    }
}

/// Converter for 64-bit integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongConverter;

impl MetaConverter<i64> for LongConverter {
    fn type_name(&self) -> &str {
        "long"
    }

    fn to_meta(&self, value: &i64) -> Meta {
        Meta::of(*value)
    }

    fn from_meta(&self, meta: &Meta) -> Result<i64, ConvertError> {
        meta.value()
            .and_then(Value::as_i64)
            .ok_or_else(|| ConvertError::WrongShape { expected: "long", found: found(meta) })
    }
}

/// Converter for doubles; integer payloads coerce.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleConverter;

impl MetaConverter<f64> for DoubleConverter {
    fn type_name(&self) -> &str {
        "double"
    }

    fn to_meta(&self, value: &f64) -> Meta {
        Meta::of(*value)
    }

    fn from_meta(&self, meta: &Meta) -> Result<f64, ConvertError> {
        meta.value()
            .and_then(Value::as_f64)
            .ok_or_else(|| ConvertError::WrongShape { expected: "double", found: found(meta) })
    }
}

/// Converter for strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringConverter;

impl MetaConverter<String> for StringConverter {
    fn type_name(&self) -> &str {
        "string"
    }

    fn to_meta(&self, value: &String) -> Meta {
        Meta::of(value.as_str())
    }

    fn from_meta(&self, meta: &Meta) -> Result<String, ConvertError> {
        meta.value()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConvertError::WrongShape { expected: "string", found: found(meta) })
    }
}

/// Identity converter for raw meta values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaIdentityConverter;

impl MetaConverter<Meta> for MetaIdentityConverter {
    fn type_name(&self) -> &str {
        "meta"
    }

    fn to_meta(&self, value: &Meta) -> Meta {
        value.clone()
    }

    fn from_meta(&self, meta: &Meta) -> Result<Meta, ConvertError> {
        Ok(meta.clone())
    }
}

/// Converter for enums carried by serial name (`Display`/`FromStr` pair,
/// typically a `strum` derive).
pub struct EnumConverter<T> {
    type_name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EnumConverter<T> {
    /// Create with the descriptor-facing type name.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> MetaConverter<T> for EnumConverter<T>
where
    T: ToString + FromStr + Send + Sync,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn to_meta(&self, value: &T) -> Meta {
        Meta::of(Value::Enum(value.to_string()))
    }

    fn from_meta(&self, meta: &Meta) -> Result<T, ConvertError> {
        let text = meta
            .value()
            .and_then(Value::as_str)
            .ok_or_else(|| ConvertError::WrongShape { expected: "enum", found: found(meta) })?;
        text.parse()
            .map_err(|_| ConvertError::UnknownConstant(text.to_string()))
    }
}

/// Converter for any serde record, bridged through JSON.
pub struct SerdeConverter<T> {
    type_name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeConverter<T> {
    /// Create with the descriptor-facing type name.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> MetaConverter<T> for SerdeConverter<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn to_meta(&self, value: &T) -> Meta {
        match serde_json::to_value(value) {
            Ok(json) => json_to_meta(&json),
            Err(_) => Meta::new(),
        }
    }

    fn from_meta(&self, meta: &Meta) -> Result<T, ConvertError> {
        let json = meta_to_json(meta);
        serde_json::from_value(json).map_err(|e| ConvertError::Record(e.to_string()))
    }
}

/// Map a JSON tree onto a meta tree.
pub fn json_to_meta(json: &serde_json::Value) -> Meta {
    use serde_json::Value as Json;
    match json {
        Json::Null => Meta::of(Value::Null),
        Json::Bool(b) => Meta::of(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Meta::of(i)
            } else {
                Meta::of(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Meta::of(s.as_str()),
        Json::Array(items) => {
            let scalars: Option<Vec<Value>> = items
                .iter()
                .map(|item| json_to_meta(item).value().cloned())
                .collect();
            match scalars {
                Some(values) => Meta::of(Value::List(values)),
                None => {
                    let mut node = Meta::new();
                    for item in items {
                        let _ = node.append("item", json_to_meta(item));
                    }
                    node
                }
            }
        }
        Json::Object(map) => {
            let mut node = Meta::new();
            for (key, value) in map {
                let _ = node.append(key, json_to_meta(value));
            }
            node
        }
    }
}

/// Map a meta tree back onto JSON.
pub fn meta_to_json(meta: &Meta) -> serde_json::Value {
    use serde_json::Value as Json;
    if meta.items().is_empty() {
        return match meta.value() {
            None | Some(Value::Null) => Json::Null,
            Some(Value::Bool(b)) => Json::Bool(*b),
            Some(Value::Int(i)) => Json::from(*i),
            Some(Value::Long(l)) => Json::from(*l),
            Some(Value::Double(d)) => serde_json::Number::from_f64(*d)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Some(Value::String(s)) | Some(Value::Enum(s)) => Json::String(s.clone()),
            Some(Value::List(values)) => Json::Array(
                values
                    .iter()
                    .map(|v| meta_to_json(&Meta::of(v.clone())))
                    .collect(),
            ),
        };
    }
    let mut object = serde_json::Map::new();
    for (key, nodes) in meta.items() {
        match nodes.as_slice() {
            [single] => {
                object.insert(key.clone(), meta_to_json(single));
            }
            many => {
                object.insert(key.clone(), Json::Array(many.iter().map(meta_to_json).collect()));
            }
        }
    }
    Json::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_scalar_round_trips() {
        assert_eq!(BoolConverter.from_meta(&BoolConverter.to_meta(&true)).unwrap(), true);
        assert_eq!(DoubleConverter.from_meta(&DoubleConverter.to_meta(&0.5)).unwrap(), 0.5);
        assert_eq!(LongConverter.from_meta(&LongConverter.to_meta(&42i64)).unwrap(), 42);
        assert_eq!(
            StringConverter.from_meta(&StringConverter.to_meta(&"hi".to_string())).unwrap(),
            "hi"
        );
    }

    #[test]
    fn test_double_coerces_int_payload() {
        assert_eq!(DoubleConverter.from_meta(&Meta::of(3i64)).unwrap(), 3.0);
    }

    #[test]
    fn test_wrong_shape() {
        assert!(matches!(
            BoolConverter.from_meta(&Meta::of("nope")),
            Err(ConvertError::WrongShape { .. })
        ));
    }

    #[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
    enum Gear {
        Low,
        High,
    }

    #[test]
    fn test_enum_converter() {
        let converter = EnumConverter::<Gear>::new("gear");
        let meta = converter.to_meta(&Gear::High);
        assert_eq!(meta.value().unwrap().as_str(), Some("High"));
        assert_eq!(converter.from_meta(&meta).unwrap(), Gear::High);
        assert!(matches!(
            converter.from_meta(&Meta::of("Reverse")),
            Err(ConvertError::UnknownConstant(_))
        ));
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AxisSettings {
        limit: f64,
        label: String,
        inverted: bool,
    }

    #[test]
    fn test_serde_record_round_trip() {
        let converter = SerdeConverter::<AxisSettings>::new("axisSettings");
        let settings = AxisSettings {
            limit: 1.5,
            label: "x".to_string(),
            inverted: true,
        };
        let meta = converter.to_meta(&settings);
        assert_eq!(converter.from_meta(&meta).unwrap(), settings);
    }
}

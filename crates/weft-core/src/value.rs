//! The value model.
//!
//! Everything that crosses a port is a `Value`: the usual JSON shapes plus
//! binary buffers. Cloning a value copies buffer contents the way a
//! structured clone would; transferring a buffer (see [`crate::transfer`])
//! moves the bytes instead and leaves the source detached.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reserved key used to carry buffer contents through serialized frames.
const BYTES_KEY: &str = "$bytes";

/// A binary buffer that can be transferred between endpoints.
///
/// The handle is shared; detaching takes the bytes out and leaves every
/// holder of the same handle seeing an empty buffer.
#[derive(Clone, Default)]
pub struct Buffer {
    cell: Arc<Mutex<Option<Bytes>>>,
}

impl Buffer {
    /// A zero-filled buffer of the given length.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Some(Bytes::from(data)))),
        }
    }

    /// Wrap bytes taken from another buffer into a fresh handle.
    pub(crate) fn adopt(bytes: Option<Bytes>) -> Self {
        Self {
            cell: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Current length; zero once the buffer has been detached.
    pub fn byte_len(&self) -> usize {
        self.cell
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |b| b.len())
    }

    pub fn is_detached(&self) -> bool {
        self.cell
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Take the bytes out, detaching every handle that shares this cell.
    pub fn detach(&self) -> Option<Bytes> {
        self.cell.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// A cheap view of the current contents, if any.
    pub fn peek(&self) -> Option<Bytes> {
        self.cell
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// A new handle holding a copy of this buffer's contents.
    pub fn deep_copy(&self) -> Self {
        Self::adopt(self.peek())
    }

    pub(crate) fn same_cell(a: &Buffer, b: &Buffer) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_detached() {
            write!(f, "Buffer(detached)")
        } else {
            write!(f, "Buffer({} bytes)", self.byte_len())
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.peek() == other.peek()
    }
}

/// A structured-cloneable value.
#[derive(Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Buffer(Buffer),
    /// Hidden transfer tag: the wrapped value plus the buffers that must be
    /// moved rather than copied when it is sent. Stripped by the engine
    /// before anything reaches a port; see [`crate::transfer`].
    Transfer {
        value: Box<Value>,
        transfer: Vec<Buffer>,
    },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// Map entry by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Array element by index.
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.as_array().and_then(|a| a.get(index))
    }

    pub fn empty_map() -> Value {
        Value::Map(BTreeMap::new())
    }
}

/// Structured-clone semantics: buffers are copied, not shared. The transfer
/// tag keeps its handles so a clone of a tagged value still detaches the
/// same sources when sent.
impl Clone for Value {
    fn clone(&self) -> Self {
        match self {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Number(n.clone()),
            Value::String(s) => Value::String(s.clone()),
            Value::Array(a) => Value::Array(a.clone()),
            Value::Map(m) => Value::Map(m.clone()),
            Value::Buffer(b) => Value::Buffer(b.deep_copy()),
            Value::Transfer { value, transfer } => Value::Transfer {
                value: value.clone(),
                transfer: transfer.to_vec(),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::Transfer { value: a, .. }, Value::Transfer { value: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
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

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<Buffer> for Value {
    fn from(v: Buffer) -> Self {
        Value::Buffer(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(a) => a.serialize(serializer),
            Value::Map(m) => m.serialize(serializer),
            Value::Buffer(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BYTES_KEY, &b.peek().map(|bytes| bytes.to_vec()))?;
                map.end()
            }
            // The engine strips tags before serialization; if one slips
            // through, only the wrapped value goes on the wire.
            Value::Transfer { value, .. } => value.serialize(serializer),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a structured-cloneable value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
        Ok(serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Buffer(Buffer::from_vec(v.to_vec())))
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut values = Vec::new();
        while let Some(v) = seq.next_element()? {
            values.push(v);
        }
        Ok(Value::Array(values))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            entries.insert(k, v);
        }
        if entries.len() == 1 && entries.contains_key(BYTES_KEY) {
            match entries.remove(BYTES_KEY) {
                Some(Value::Null) => return Ok(Value::Buffer(Buffer::adopt(None))),
                Some(Value::Array(items)) => {
                    let bytes: Vec<u8> = items
                        .iter()
                        .filter_map(|v| v.as_i64().map(|n| n as u8))
                        .collect();
                    return Ok(Value::Buffer(Buffer::from_vec(bytes)));
                }
                Some(other) => {
                    entries.insert(BYTES_KEY.to_string(), other);
                }
                None => {}
            }
        }
        Ok(Value::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

//! The message value tree.
//!
//! Everything that crosses a worker boundary is a [`Value`]: an owned tree of
//! scalars, lists, maps, byte buffers, shared-memory handles and live shared
//! objects. Ownership gives each node its transport semantics for free:
//!
//! - [`Buffer`] nodes *move*. Sending a message that contains one transfers
//!   the bytes; the sender's binding is gone. This is the transfer list of
//!   the message-passing model, enforced by the compiler instead of a
//!   runtime detach flag.
//! - [`Memory`] nodes *share*. The handle is an `Arc`; both sides observe
//!   the same cells.
//! - [`Value::Shared`] nodes hold live objects (synchronization primitives,
//!   registered user classes). They never cross the channel as-is: the codec
//!   rewrites them to [`Value::Dehydrated`] on send and back on receive.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::ErrorInfo;
use crate::memory::Memory;

/// A live object that can be carried inside a message.
///
/// Implementors pair this with a registry entry keyed by `hydration_key` so
/// the receiving side can rebuild the instance from the dehydrated tree.
pub trait HydrateObject: Any + Send + Sync {
    /// Registry key identifying the type on the wire.
    fn hydration_key(&self) -> &'static str;

    /// Encode into a plain value tree. Nested live objects may stay as
    /// [`Value::Shared`]; the codec rewrites them recursively.
    fn dehydrate(&self) -> Value;

    fn as_any(&self) -> &dyn Any;
}

/// An owned byte buffer with typed accessors.
///
/// Buffers move with their message; there is no way to retain access to the
/// bytes after sending them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer(Vec<u8>);

impl Buffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_i32s(values: &[i32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self(bytes)
    }

    /// Decode as little-endian i32s; a trailing partial word is dropped.
    pub fn as_i32s(&self) -> Vec<i32> {
        self.0
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// A structured message value. See the module docs for transport semantics.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Buffer(Buffer),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Memory(Memory),
    /// A live shared object; rewritten by the codec at the boundary.
    Shared(Arc<dyn HydrateObject>),
    /// The encoded form of a `Shared` node: registry key plus type-specific
    /// payload.
    Dehydrated { key: String, value: Box<Value> },
    Error(ErrorInfo),
}

impl Value {
    /// Wrap a live object for embedding in a message.
    pub fn shared(obj: impl HydrateObject) -> Self {
        Value::Shared(Arc::new(obj))
    }

    /// Build a map value from key/value pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&Memory> {
        match self {
            Value::Memory(mem) => Some(mem),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorInfo> {
        match self {
            Value::Error(info) => Some(info),
            _ => None,
        }
    }

    /// Map entry lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Downcast a hydrated `Shared` node to a concrete type by cloning it
    /// out. Live primitives are cheap handles, so the clone shares state.
    pub fn shared_as<T>(&self) -> Option<T>
    where
        T: HydrateObject + Clone,
    {
        match self {
            Value::Shared(obj) => obj.as_any().downcast_ref::<T>().cloned(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Memory(mem) => write!(f, "{mem:?}"),
            Value::Shared(obj) => write!(f, "Shared({})", obj.hydration_key()),
            Value::Dehydrated { key, value } => f
                .debug_struct("Dehydrated")
                .field("key", key)
                .field("value", value)
                .finish(),
            Value::Error(info) => write!(f, "Error({info})"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Memory(a), Value::Memory(b)) => a.same(b),
            // Shared compares by object identity
            (Value::Shared(a), Value::Shared(b)) => Arc::ptr_eq(a, b),
            (
                Value::Dehydrated { key: ka, value: va },
                Value::Dehydrated { key: kb, value: vb },
            ) => ka == kb && va == vb,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Buffer> for Value {
    fn from(b: Buffer) -> Self {
        Value::Buffer(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Memory> for Value {
    fn from(mem: Memory) -> Self {
        Value::Memory(mem)
    }
}

impl From<ErrorInfo> for Value {
    fn from(info: ErrorInfo) -> Self {
        Value::Error(info)
    }
}

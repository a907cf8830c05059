//! Transparent (de)hydration of message values.
//!
//! Live objects ([`Value::Shared`]) cannot cross the raw message-passing
//! layer; [`dehydrate`] rewrites them to tagged `{key, value}` nodes and
//! [`hydrate`] rebuilds live instances on the receiving side. Both ends of
//! every link apply the codec automatically, so user code only ever sees
//! hydrated trees.
//!
//! The registry is process-wide and seeded with the built-in entries
//! (addresses and the five synchronization primitives) before any user
//! registration. Lookup checks built-ins first, then user entries
//! newest-first, so the most recent registration wins.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::warn;

use weft_api::errors::CodecError;
use weft_api::memory::Memory;
use weft_api::value::{HydrateObject, Value};

use crate::memory::hydrate_address;
use crate::sync::{
    hydrate_barrier, hydrate_condvar, hydrate_mutex, hydrate_semaphore, hydrate_wait_group,
};

/// Wire keys of the built-in entries.
pub(crate) mod keys {
    pub const ADDRESS: &str = "address";
    pub const MUTEX: &str = "mutex";
    pub const CONDVAR: &str = "condvar";
    pub const WAITGROUP: &str = "waitgroup";
    pub const BARRIER: &str = "barrier";
    pub const SEMAPHORE: &str = "semaphore";
}

/// Rebuilds a live object from its dehydrated payload.
pub type HydrateFn =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn HydrateObject>, CodecError> + Send + Sync>;

/// A user entry in the dehydration registry.
pub struct Registration {
    pub key: String,
    pub hydrate: HydrateFn,
}

impl Registration {
    pub fn new(
        key: impl Into<String>,
        hydrate: impl Fn(&Value) -> Result<Arc<dyn HydrateObject>, CodecError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            hydrate: Arc::new(hydrate),
        }
    }
}

type BuiltinFn = fn(&Value) -> Result<Arc<dyn HydrateObject>, CodecError>;

struct Registry {
    builtins: &'static [(&'static str, BuiltinFn)],
    user: Vec<Registration>,
    user_keys: HashSet<String>,
}

fn builtin_address(value: &Value) -> Result<Arc<dyn HydrateObject>, CodecError> {
    Ok(Arc::new(hydrate_address(value)?))
}

fn builtin_mutex(value: &Value) -> Result<Arc<dyn HydrateObject>, CodecError> {
    Ok(Arc::new(hydrate_mutex(value)?))
}

fn builtin_condvar(value: &Value) -> Result<Arc<dyn HydrateObject>, CodecError> {
    Ok(Arc::new(hydrate_condvar(value)?))
}

fn builtin_wait_group(value: &Value) -> Result<Arc<dyn HydrateObject>, CodecError> {
    Ok(Arc::new(hydrate_wait_group(value)?))
}

fn builtin_barrier(value: &Value) -> Result<Arc<dyn HydrateObject>, CodecError> {
    Ok(Arc::new(hydrate_barrier(value)?))
}

fn builtin_semaphore(value: &Value) -> Result<Arc<dyn HydrateObject>, CodecError> {
    Ok(Arc::new(hydrate_semaphore(value)?))
}

const BUILTINS: &[(&str, BuiltinFn)] = &[
    (keys::ADDRESS, builtin_address),
    (keys::MUTEX, builtin_mutex),
    (keys::CONDVAR, builtin_condvar),
    (keys::WAITGROUP, builtin_wait_group),
    (keys::BARRIER, builtin_barrier),
    (keys::SEMAPHORE, builtin_semaphore),
];

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        builtins: BUILTINS,
        user: Vec::new(),
        user_keys: HashSet::new(),
    })
});

/// Append a user entry to the dehydration registry.
///
/// Keys must be unique across built-ins and previous registrations;
/// registrations are additive for the life of the process.
pub fn register_dehydration(registration: Registration) -> Result<(), CodecError> {
    if registration.key.is_empty() {
        return Err(CodecError::InvalidRegistration("empty key".into()));
    }
    let mut registry = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    if registry.builtins.iter().any(|(k, _)| *k == registration.key)
        || registry.user_keys.contains(&registration.key)
    {
        return Err(CodecError::DuplicateKey(registration.key));
    }
    registry.user_keys.insert(registration.key.clone());
    registry.user.push(registration);
    Ok(())
}

fn lookup(key: &str, value: &Value) -> Result<Arc<dyn HydrateObject>, CodecError> {
    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    if let Some((_, f)) = registry.builtins.iter().find(|(k, _)| *k == key) {
        return f(value);
    }
    // Newest registration wins
    if let Some(entry) = registry.user.iter().rev().find(|e| e.key == key) {
        return (entry.hydrate)(value);
    }
    Err(CodecError::UnknownKey(key.to_string()))
}

/// Rewrite every live object in `value` into its transportable form.
///
/// Scalars, buffers, memory handles and transported errors pass through;
/// lists and maps recurse. Values are finite trees, so recursion terminates.
pub fn dehydrate(value: Value) -> Value {
    match value {
        Value::Shared(obj) => {
            let key = obj.hydration_key().to_string();
            let inner = dehydrate(obj.dehydrate());
            Value::Dehydrated {
                key,
                value: Box::new(inner),
            }
        }
        Value::List(items) => Value::List(items.into_iter().map(dehydrate).collect()),
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, dehydrate(v))).collect()),
        other => other,
    }
}

/// Rebuild live objects from a received value.
///
/// A node whose key has no registry entry (or whose payload the entry
/// rejects) is logged and left in dehydrated form rather than dropped.
pub fn hydrate(value: Value) -> Value {
    match value {
        Value::Dehydrated { key, value } => {
            let inner = hydrate(*value);
            match lookup(&key, &inner) {
                Ok(obj) => Value::Shared(obj),
                Err(error) => {
                    warn!(%key, %error, "leaving value dehydrated");
                    Value::Dehydrated {
                        key,
                        value: Box::new(inner),
                    }
                }
            }
        }
        Value::List(items) => Value::List(items.into_iter().map(hydrate).collect()),
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, hydrate(v))).collect()),
        other => other,
    }
}

// Field helpers shared by the built-in hydrate functions.

pub(crate) fn malformed(key: &str, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        key: key.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn req_field<'a>(
    value: &'a Value,
    field: &'static str,
    key: &'static str,
) -> Result<&'a Value, CodecError> {
    value
        .get(field)
        .ok_or_else(|| malformed(key, format!("missing `{field}`")))
}

pub(crate) fn req_int(value: &Value, field: &'static str, key: &'static str) -> Result<i64, CodecError> {
    req_field(value, field, key)?
        .as_int()
        .ok_or_else(|| malformed(key, format!("`{field}` is not an integer")))
}

pub(crate) fn req_str<'a>(
    value: &'a Value,
    field: &'static str,
    key: &'static str,
) -> Result<&'a str, CodecError> {
    req_field(value, field, key)?
        .as_str()
        .ok_or_else(|| malformed(key, format!("`{field}` is not a string")))
}

pub(crate) fn req_memory(
    value: &Value,
    field: &'static str,
    key: &'static str,
) -> Result<Memory, CodecError> {
    req_field(value, field, key)?
        .as_memory()
        .cloned()
        .ok_or_else(|| malformed(key, format!("`{field}` is not a memory handle")))
}

pub(crate) fn req_shared<T>(
    value: &Value,
    field: &'static str,
    key: &'static str,
) -> Result<T, CodecError>
where
    T: HydrateObject + Clone,
{
    req_field(value, field, key)?
        .shared_as::<T>()
        .ok_or_else(|| malformed(key, format!("`{field}` is not a hydrated object")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Address, AnyAddress};
    use crate::sync::Mutex;

    #[test]
    fn address_round_trip_shares_cells() {
        let addr = Address::<i32>::alloc(2).expect("alloc");
        addr.set(41, 1);

        let wire = dehydrate(Value::shared(addr.erase()));
        assert!(matches!(wire, Value::Dehydrated { .. }));

        let back = hydrate(wire);
        let any: AnyAddress = back.shared_as().expect("hydrated address");
        let typed: Address<i32> = any.typed().expect("i32 view");
        assert_eq!(typed.get(1), 41);

        // Same cells, not a copy
        typed.set(42, 1);
        assert_eq!(addr.get(1), 42);
    }

    #[test]
    fn nested_values_recurse() {
        let mutex = Mutex::make().expect("make");
        let message = Value::map([
            ("label", Value::from("guard")),
            ("lock", Value::shared(mutex.clone())),
            (
                "extra",
                Value::List(vec![Value::Int(1), Value::shared(mutex.clone())]),
            ),
        ]);

        let wire = dehydrate(message);
        assert!(matches!(
            wire.get("lock"),
            Some(Value::Dehydrated { .. })
        ));

        let back = hydrate(wire);
        let lock: Mutex = back
            .get("lock")
            .and_then(|v| v.shared_as())
            .expect("hydrated mutex");
        assert!(lock.try_lock());
        // Same lock word: the original handle observes the hydrated holder
        assert!(!mutex.try_lock());
        lock.unlock();
    }

    #[test]
    fn unknown_key_passes_through() {
        let wire = Value::Dehydrated {
            key: "no-such-key".into(),
            value: Box::new(Value::Int(5)),
        };
        let back = hydrate(wire.clone());
        assert_eq!(back, wire);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        register_dehydration(Registration::new("codec-test-entry", |v| {
            Err(malformed("codec-test-entry", format!("unused {v:?}")))
        }))
        .expect("first registration");

        let again = register_dehydration(Registration::new("codec-test-entry", |_| {
            unreachable!("never invoked")
        }));
        assert!(matches!(again, Err(CodecError::DuplicateKey(_))));

        let builtin = register_dehydration(Registration::new(keys::MUTEX, |_| {
            unreachable!("never invoked")
        }));
        assert!(matches!(builtin, Err(CodecError::DuplicateKey(_))));

        let empty = register_dehydration(Registration::new("", |_| {
            unreachable!("never invoked")
        }));
        assert!(matches!(empty, Err(CodecError::InvalidRegistration(_))));
    }

    #[test]
    fn user_types_round_trip() {
        #[derive(Debug, Clone)]
        struct TempReading {
            celsius: i64,
        }

        impl HydrateObject for TempReading {
            fn hydration_key(&self) -> &'static str {
                "codec-test-temp"
            }

            fn dehydrate(&self) -> Value {
                Value::map([("celsius", Value::from(self.celsius))])
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        register_dehydration(Registration::new("codec-test-temp", |v| {
            let celsius = req_int(v, "celsius", "codec-test-temp")?;
            Ok(Arc::new(TempReading { celsius }) as Arc<dyn HydrateObject>)
        }))
        .expect("registration");

        let wire = dehydrate(Value::shared(TempReading { celsius: 21 }));
        let back = hydrate(wire);
        let reading: TempReading = back.shared_as().expect("hydrated");
        assert_eq!(reading.celsius, 21);
    }
}

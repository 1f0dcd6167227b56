// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Runtime values exchanged between the loader and the evaluator.
//!
//! The loader itself never interprets these beyond moving them between
//! exports objects; the shape exists so that exports can be shared by
//! reference with every importer, including importers that observe a
//! module mid-evaluation.

use crate::error::{LoaderError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A value a module can export
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value
    Undefined,
    /// Explicit null
    Null,
    /// Boolean
    Boolean(bool),
    /// Double-precision number
    Number(f64),
    /// String
    String(String),
    /// Object backed by shared storage
    Object(ExportsObject),
    /// Function implemented by the host
    NativeFunction(NativeFunction),
}

impl Value {
    /// Whether this is `Undefined`
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Boolean payload, if any
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// String payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Object payload, if any
    pub fn as_object(&self) -> Option<&ExportsObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

/// A host function exposed through a built-in module
#[derive(Clone)]
pub struct NativeFunction {
    name: &'static str,
    func: Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>,
}

impl NativeFunction {
    /// Wrap a host closure
    pub fn new(
        name: &'static str,
        func: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            func: Arc::new(func),
        }
    }

    /// Name the function was registered under
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invoke the function
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.func)(args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[native function {}]", self.name)
    }
}

/// The exports of a single module.
///
/// Storage is shared: cloning yields another handle to the same map, which
/// is how cyclic importers observe a module's current (possibly incomplete)
/// exports before its evaluation finishes.
#[derive(Debug, Clone, Default)]
pub struct ExportsObject {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl ExportsObject {
    /// Create an empty exports object
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an exported value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Write an exported value
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().insert(key.into(), value);
    }

    /// All exported keys
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Number of exported entries
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether nothing has been exported yet
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Whether two handles point at the same storage
    pub fn shares_storage(&self, other: &ExportsObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wrap the handle as a value
    pub fn to_value(&self) -> Value {
        Value::Object(self.clone())
    }
}

/// Publish an arbitrary value into a module's exports.
///
/// Object entries are copied key by key so importers holding the exports
/// handle see them; the whole value is additionally exposed as `default`.
pub fn publish_into(exports: &ExportsObject, value: Value) {
    if let Value::Object(obj) = &value {
        for key in obj.keys() {
            if let Some(entry) = obj.get(&key) {
                exports.set(key, entry);
            }
        }
    }
    exports.set("default", value);
}

/// Convert parsed JSON into a module value
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(arr) => {
            let obj = ExportsObject::new();
            for (i, item) in arr.iter().enumerate() {
                obj.set(i.to_string(), json_to_value(item));
            }
            obj.set("length", Value::Number(arr.len() as f64));
            Value::Object(obj)
        }
        serde_json::Value::Object(map) => {
            let obj = ExportsObject::new();
            for (key, item) in map {
                obj.set(key.clone(), json_to_value(item));
            }
            Value::Object(obj)
        }
    }
}

/// Coerce a value to a string argument for a built-in function
pub fn expect_string(args: &[Value], index: usize, what: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(LoaderError::Type(format!(
            "{what} must be a string, got {other:?}"
        ))),
        None => Err(LoaderError::Type(format!("{what} is required"))),
    }
}

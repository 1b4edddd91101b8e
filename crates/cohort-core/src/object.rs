//! Shared objects and the recipes used to instantiate them on every member.

use crate::error::{BoxError, CohortError};
use crate::id::Id;
use crate::registry::{ArgType, Description, Instantiator};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Recipe for instantiating a shared object on a group member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedObjectDescriptor {
    pub object_id: Id,
    /// Name of the shared-object description to instantiate.
    pub implementation: String,
    pub init_args: Value,
}

impl SharedObjectDescriptor {
    pub fn new(object_id: Id, implementation: impl Into<String>) -> Self {
        Self {
            object_id,
            implementation: implementation.into(),
            init_args: Value::Null,
        }
    }

    pub fn with_init_args(mut self, init_args: Value) -> Self {
        self.init_args = init_args;
        self
    }
}

/// An application-defined entity replicated identically across a group.
pub trait SharedObject: Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> &Id;

    /// Recipe, including current state, for recreating this object on a
    /// member that joins after it was committed.
    fn replica_descriptor(&self) -> SharedObjectDescriptor;

    /// Called once when the object leaves the local directory.
    fn dispose(&self) {}
}

/// Implementation name of [`SharedValue`].
pub const SHARED_VALUE: &str = "cohort.value";

/// A shared object holding a single JSON value.
#[derive(Debug)]
pub struct SharedValue {
    id: Id,
    value: RwLock<Value>,
}

impl SharedValue {
    pub fn new(id: Id, value: Value) -> Self {
        Self {
            id,
            value: RwLock::new(value),
        }
    }

    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    pub fn set(&self, value: Value) {
        *self.value.write() = value;
    }
}

impl SharedObject for SharedValue {
    fn id(&self) -> &Id {
        &self.id
    }

    fn replica_descriptor(&self) -> SharedObjectDescriptor {
        SharedObjectDescriptor::new(self.id.clone(), SHARED_VALUE).with_init_args(self.get())
    }
}

/// Builds [`SharedValue`]s. Expects `[object_id, init_args]`.
pub struct SharedValueInstantiator;

impl SharedValueInstantiator {
    /// Description registering this instantiator under [`SHARED_VALUE`].
    pub fn description() -> Description<dyn SharedObject> {
        Description::new(SHARED_VALUE, SharedValueInstantiator)
            .with_signature(vec![ArgType::String, ArgType::Any])
    }
}

impl Instantiator<dyn SharedObject> for SharedValueInstantiator {
    fn make_instance(
        &self,
        _description: &Description<dyn SharedObject>,
        args: &[Value],
    ) -> Result<Box<dyn SharedObject>, BoxError> {
        let id = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| CohortError::NotFound("object id argument".into()))?;
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        Ok(Box::new(SharedValue::new(Id::from_string(id), value)))
    }
}

/// Arguments handed to a shared-object instantiator for a descriptor.
pub fn instantiation_args(descriptor: &SharedObjectDescriptor) -> [Value; 2] {
    [
        Value::String(descriptor.object_id.to_string()),
        descriptor.init_args.clone(),
    ]
}

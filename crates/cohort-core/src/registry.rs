//! Name-keyed registry of constructible implementations.
//!
//! One registry instance exists per capability (container types, connection
//! types, shared-object types). Registries are ordinary values owned by an
//! application context; there are no process-wide singletons.
//!
//! Registering a name that is already present replaces the old description
//! and hands it back to the caller: last write wins.

use crate::error::{BoxError, CohortError, InstantiationCause, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Coarse type of a factory argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgType {
    String,
    Integer,
    Boolean,
    /// Matches any value, including null and structured JSON.
    Any,
}

impl ArgType {
    /// Infer the type of an argument value.
    pub fn of(value: &Value) -> ArgType {
        match value {
            Value::String(_) => ArgType::String,
            Value::Bool(_) => ArgType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ArgType::Integer,
            _ => ArgType::Any,
        }
    }

    fn accepts(self, actual: ArgType) -> bool {
        self == ArgType::Any || self == actual
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgType::String => "string",
            ArgType::Integer => "integer",
            ArgType::Boolean => "boolean",
            ArgType::Any => "any",
        };
        f.write_str(name)
    }
}

/// Constructs instances of `T` for a description.
pub trait Instantiator<T: ?Sized + 'static>: Send + Sync {
    fn make_instance(
        &self,
        description: &Description<T>,
        args: &[Value],
    ) -> std::result::Result<Box<T>, BoxError>;
}

/// A named, constructible implementation.
pub struct Description<T: ?Sized + 'static> {
    name: String,
    instantiator: Option<Arc<dyn Instantiator<T>>>,
    loader_context: Option<String>,
    extra: Value,
    signatures: Vec<Vec<ArgType>>,
}

impl<T: ?Sized + 'static> Description<T> {
    pub fn new(name: impl Into<String>, instantiator: impl Instantiator<T> + 'static) -> Self {
        Self {
            name: name.into(),
            instantiator: Some(Arc::new(instantiator)),
            loader_context: None,
            extra: Value::Null,
            signatures: Vec::new(),
        }
    }

    /// A description with no implementation bound yet.
    pub fn unbound(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instantiator: None,
            loader_context: None,
            extra: Value::Null,
            signatures: Vec::new(),
        }
    }

    /// Add a supported argument signature. A description without any
    /// signature accepts every argument list.
    pub fn with_signature(mut self, signature: Vec<ArgType>) -> Self {
        self.signatures.push(signature);
        self
    }

    pub fn with_loader_context(mut self, context: impl Into<String>) -> Self {
        self.loader_context = Some(context.into());
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader_context(&self) -> Option<&str> {
        self.loader_context.as_deref()
    }

    pub fn extra(&self) -> &Value {
        &self.extra
    }

    pub fn signatures(&self) -> &[Vec<ArgType>] {
        &self.signatures
    }

    fn supports(&self, types: &[ArgType]) -> bool {
        self.signatures.is_empty()
            || self.signatures.iter().any(|sig| {
                sig.len() == types.len() && sig.iter().zip(types).all(|(s, t)| s.accepts(*t))
            })
    }
}

impl<T: ?Sized + 'static> Clone for Description<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            instantiator: self.instantiator.clone(),
            loader_context: self.loader_context.clone(),
            extra: self.extra.clone(),
            signatures: self.signatures.clone(),
        }
    }
}

impl<T: ?Sized + 'static> fmt::Debug for Description<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Description")
            .field("name", &self.name)
            .field("bound", &self.instantiator.is_some())
            .field("loader_context", &self.loader_context)
            .field("signatures", &self.signatures)
            .finish()
    }
}

/// Registry of descriptions for one capability.
pub struct DescriptionRegistry<T: ?Sized + 'static> {
    descriptions: Mutex<HashMap<String, Arc<Description<T>>>>,
}

impl<T: ?Sized + 'static> DescriptionRegistry<T> {
    pub fn new() -> Self {
        Self {
            descriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace by name. Returns the replaced description.
    pub fn register(&self, description: Description<T>) -> Option<Arc<Description<T>>> {
        debug!(name = %description.name, "registering description");
        let name = description.name.clone();
        self.descriptions.lock().insert(name, Arc::new(description))
    }

    /// Remove by name. Returns the removed description.
    pub fn unregister(&self, name: &str) -> Option<Arc<Description<T>>> {
        debug!(name, "unregistering description");
        self.descriptions.lock().remove(name)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Description<T>>> {
        self.descriptions
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CohortError::NotFound(format!("description '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptions.lock().contains_key(name)
    }

    /// Snapshot of every registered description, ordered by name.
    pub fn descriptions(&self) -> Vec<Arc<Description<T>>> {
        let mut all: Vec<_> = self.descriptions.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.descriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `name` and construct an instance from `args`.
    ///
    /// When `arg_types` is `None` the types are inferred from the values.
    /// Every construction failure comes back as
    /// [`CohortError::Instantiation`] with the cause attached.
    pub fn create(
        &self,
        name: &str,
        arg_types: Option<&[ArgType]>,
        args: &[Value],
    ) -> Result<Box<T>> {
        let description = self.lookup(name)?;

        let types: Vec<ArgType> = match arg_types {
            Some(declared) => {
                let consistent = declared.len() == args.len()
                    && declared
                        .iter()
                        .zip(args)
                        .all(|(t, v)| t.accepts(ArgType::of(v)));
                if !consistent {
                    return Err(mismatch(name, declared));
                }
                declared.to_vec()
            }
            None => args.iter().map(ArgType::of).collect(),
        };

        if !description.supports(&types) {
            return Err(mismatch(name, &types));
        }

        let instantiator = description.instantiator.as_ref().ok_or_else(|| {
            CohortError::instantiation(name, InstantiationCause::MissingImplementation(name.into()))
        })?;

        instantiator
            .make_instance(&description, args)
            .map_err(|e| CohortError::instantiation(name, InstantiationCause::Constructor(e)))
    }
}

impl<T: ?Sized + 'static> Default for DescriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn mismatch(name: &str, types: &[ArgType]) -> CohortError {
    let found = types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    CohortError::instantiation(
        name,
        InstantiationCause::SignatureMismatch {
            name: name.into(),
            found,
        },
    )
}

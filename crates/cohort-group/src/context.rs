//! Explicitly constructed registries for containers, connections and
//! shared objects.

use crate::config::ContainerConfig;
use crate::container::SharedObjectContainer;
use crate::transport::{MemoryHub, NetworkTransport};
use cohort_core::object::SharedValueInstantiator;
use cohort_core::{
    ArgType, BoxError, Description, DescriptionRegistry, Id, Result, SharedObject,
};
use serde_json::Value;
use std::sync::Arc;

/// Container type backed by a [`SharedObjectContainer`].
pub const GENERIC_CONTAINER: &str = "cohort.generic";
/// Connection type backed by a [`MemoryHub`].
pub const MEMORY_CONNECTION: &str = "cohort.memory";

/// The registries an application instantiates containers through.
pub struct GroupContext {
    containers: DescriptionRegistry<SharedObjectContainer>,
    connections: Arc<DescriptionRegistry<dyn NetworkTransport>>,
    objects: Arc<DescriptionRegistry<dyn SharedObject>>,
}

impl GroupContext {
    /// Empty registries.
    pub fn new() -> Self {
        Self {
            containers: DescriptionRegistry::new(),
            connections: Arc::new(DescriptionRegistry::new()),
            objects: Arc::new(DescriptionRegistry::new()),
        }
    }

    /// Registries populated with the default container, connection and
    /// shared-object types, all running over `hub`.
    pub fn with_memory_hub(hub: Arc<MemoryHub>) -> Self {
        let context = Self::new();
        context
            .connections
            .register(MemoryConnectionInstantiator::description(hub));
        context.objects.register(SharedValueInstantiator::description());
        context.containers.register(GenericContainerInstantiator::description(
            MEMORY_CONNECTION,
            context.connections.clone(),
            context.objects.clone(),
        ));
        context
    }

    pub fn containers(&self) -> &DescriptionRegistry<SharedObjectContainer> {
        &self.containers
    }

    pub fn connections(&self) -> &Arc<DescriptionRegistry<dyn NetworkTransport>> {
        &self.connections
    }

    pub fn objects(&self) -> &Arc<DescriptionRegistry<dyn SharedObject>> {
        &self.objects
    }

    /// Instantiate a container of the registered type `name`.
    pub fn create_container(&self, name: &str, args: &[Value]) -> Result<SharedObjectContainer> {
        self.containers.create(name, None, args).map(|c| *c)
    }
}

impl Default for GroupContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds [`SharedObjectContainer`]s.
///
/// Accepts `[]`, `[id]` or `[id, transaction_timeout_ms]`; a missing id is
/// generated. Needs a running tokio runtime.
pub struct GenericContainerInstantiator {
    connection: String,
    connections: Arc<DescriptionRegistry<dyn NetworkTransport>>,
    objects: Arc<DescriptionRegistry<dyn SharedObject>>,
    config: ContainerConfig,
}

impl GenericContainerInstantiator {
    pub fn new(
        connection: impl Into<String>,
        connections: Arc<DescriptionRegistry<dyn NetworkTransport>>,
        objects: Arc<DescriptionRegistry<dyn SharedObject>>,
    ) -> Self {
        Self {
            connection: connection.into(),
            connections,
            objects,
            config: ContainerConfig::default(),
        }
    }

    /// Base configuration; a timeout argument overrides its transaction
    /// timeout.
    pub fn with_config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn description(
        connection: impl Into<String>,
        connections: Arc<DescriptionRegistry<dyn NetworkTransport>>,
        objects: Arc<DescriptionRegistry<dyn SharedObject>>,
    ) -> Description<SharedObjectContainer> {
        Description::new(
            GENERIC_CONTAINER,
            Self::new(connection, connections, objects),
        )
        .with_signature(vec![])
        .with_signature(vec![ArgType::String])
        .with_signature(vec![ArgType::String, ArgType::Integer])
    }
}

impl cohort_core::Instantiator<SharedObjectContainer> for GenericContainerInstantiator {
    fn make_instance(
        &self,
        _description: &Description<SharedObjectContainer>,
        args: &[Value],
    ) -> std::result::Result<Box<SharedObjectContainer>, BoxError> {
        tokio::runtime::Handle::try_current()?;

        let id = match args.first().and_then(Value::as_str) {
            Some(id) => Id::from_string(id),
            None => Id::unique(),
        };
        let mut config = self.config.clone();
        if let Some(timeout_ms) = args.get(1).and_then(Value::as_u64) {
            config.transaction_timeout_ms = timeout_ms;
        }

        let transport: Arc<dyn NetworkTransport> = Arc::from(self.connections.create(
            &self.connection,
            None,
            &[Value::String(id.to_string())],
        )?);
        let container = SharedObjectContainer::new(id, transport, self.objects.clone(), config)?;
        Ok(Box::new(container))
    }
}

/// Builds [`MemoryTransport`](crate::MemoryTransport)s on one hub.
/// Expects `[id]`.
pub struct MemoryConnectionInstantiator {
    hub: Arc<MemoryHub>,
}

impl MemoryConnectionInstantiator {
    pub fn description(hub: Arc<MemoryHub>) -> Description<dyn NetworkTransport> {
        Description::new(MEMORY_CONNECTION, Self { hub })
            .with_signature(vec![ArgType::String])
    }
}

impl cohort_core::Instantiator<dyn NetworkTransport> for MemoryConnectionInstantiator {
    fn make_instance(
        &self,
        _description: &Description<dyn NetworkTransport>,
        args: &[Value],
    ) -> std::result::Result<Box<dyn NetworkTransport>, BoxError> {
        let id = args
            .first()
            .and_then(Value::as_str)
            .ok_or("missing endpoint id")?;
        Ok(Box::new(self.hub.transport(Id::from_string(id))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::{CohortError, InstantiationCause};
    use serde_json::json;

    #[test]
    fn test_defaults_registered() {
        let context = GroupContext::with_memory_hub(MemoryHub::new());

        assert!(context.containers().contains(GENERIC_CONTAINER));
        assert!(context.connections().contains(MEMORY_CONNECTION));
        assert!(context.objects().contains(cohort_core::object::SHARED_VALUE));
    }

    #[tokio::test]
    async fn test_create_container_with_timeout() {
        let hub = MemoryHub::new();
        let context = GroupContext::with_memory_hub(hub.clone());

        let container = context
            .create_container(GENERIC_CONTAINER, &[json!("client-1"), json!(2500)])
            .unwrap();

        assert_eq!(container.id(), &Id::from("client-1"));
        assert_eq!(container.config().transaction_timeout_ms, 2500);
        assert_eq!(hub.endpoints(), vec![Id::from("client-1")]);
    }

    #[tokio::test]
    async fn test_signature_mismatch() {
        let context = GroupContext::with_memory_hub(MemoryHub::new());

        let err = context
            .create_container(GENERIC_CONTAINER, &[json!(true)])
            .unwrap_err();
        assert!(matches!(err, CohortError::Instantiation { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_is_constructor_failure() {
        let context = GroupContext::with_memory_hub(MemoryHub::new());
        let _first = context
            .create_container(GENERIC_CONTAINER, &[json!("a")])
            .unwrap();

        match context.create_container(GENERIC_CONTAINER, &[json!("a")]) {
            Err(CohortError::Instantiation { source, .. }) => {
                assert!(matches!(*source, InstantiationCause::Constructor(_)))
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_container_needs_runtime() {
        let context = GroupContext::with_memory_hub(MemoryHub::new());
        assert!(context.create_container(GENERIC_CONTAINER, &[]).is_err());
    }

    #[test]
    fn test_unknown_container_type() {
        let context = GroupContext::new();
        assert!(matches!(
            context.create_container("nope", &[]),
            Err(CohortError::NotFound(_))
        ));
    }
}

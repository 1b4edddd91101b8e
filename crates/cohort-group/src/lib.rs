//! # cohort-group
//!
//! Group membership and transactional replication of shared objects.
//!
//! A [`SharedObjectContainer`] joins a group through any connected member,
//! then creates shared objects with an all-or-nothing replication
//! transaction: the object is installed on every member of the group or,
//! on the first refusal or once the deadline passes, removed again
//! everywhere.
//!
//! # Quick Start
//!
//! ```rust
//! use cohort_group::{GroupContext, MemoryHub, GENERIC_CONTAINER};
//! use cohort_core::object::SHARED_VALUE;
//! use cohort_core::{Id, SharedObjectDescriptor};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let context = GroupContext::with_memory_hub(MemoryHub::new());
//! let server = context.create_container(GENERIC_CONTAINER, &[json!("server")]).unwrap();
//! let client = context.create_container(GENERIC_CONTAINER, &[json!("client")]).unwrap();
//!
//! server.connect(server.id()).await.unwrap();
//! client.connect(server.id()).await.unwrap();
//!
//! let descriptor = SharedObjectDescriptor::new(Id::from("notes"), SHARED_VALUE)
//!     .with_init_args(json!("hello"));
//! let txn = client.create_shared_object(descriptor).await.unwrap();
//! txn.wait_to_commit().await.unwrap();
//!
//! assert!(server.directory().contains(&Id::from("notes")));
//! # });
//! ```
//!
//! # Architecture
//!
//! - [`container`] - the container and its control task
//! - [`membership`] - the local view of group membership
//! - [`transaction`] - the replication transaction engine
//! - [`message`] - control-plane messages
//! - [`transport`] - transport abstraction and the in-memory hub
//! - [`context`] - registries of container, connection and object types
//! - [`config`] - container configuration

pub mod config;
pub mod container;
pub mod context;
pub mod membership;
pub mod message;
pub mod transaction;
pub mod transport;

pub use config::{ContainerConfig, ContainerConfigBuilder, OrphanPolicy};
pub use container::{ContainerEvent, SharedObjectContainer};
pub use context::{
    GenericContainerInstantiator, GroupContext, MemoryConnectionInstantiator, GENERIC_CONTAINER,
    MEMORY_CONNECTION,
};
pub use membership::{GroupMembership, MembershipManager};
pub use message::GroupMessage;
pub use transaction::{
    EngineAction, ReplicationEngine, Transaction, TransactionState, TransactionStatus,
    MAX_TRANSACTION_TIMEOUT,
};
pub use transport::{MemoryHub, MemoryTransport, NetworkError, NetworkTransport, TransportEvent};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ContainerConfig, OrphanPolicy};
    pub use crate::container::{ContainerEvent, SharedObjectContainer};
    pub use crate::context::{GroupContext, GENERIC_CONTAINER};
    pub use crate::transaction::{Transaction, TransactionState};
    pub use crate::transport::{MemoryHub, NetworkTransport};
    pub use cohort_core::{AbortSignal, CohortError, Id, SharedObject, SharedObjectDescriptor};
}

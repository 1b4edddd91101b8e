//! # cohort-core
//!
//! Building blocks shared by every Cohort container:
//! - [`Id`] and [`TransactionId`] identifiers
//! - the [`CohortError`] taxonomy and [`AbortSignal`]
//! - [`DescriptionRegistry`], a name-keyed registry of instantiators
//! - [`SharedObject`] and the [`SharedObjectDirectory`] holding the local
//!   instances of a container
//!
//! ## Example
//!
//! ```rust
//! use cohort_core::{DescriptionRegistry, Id, SharedObjectDescriptor, SharedObjectDirectory};
//! use cohort_core::object::{SharedValueInstantiator, SHARED_VALUE};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let factories = Arc::new(DescriptionRegistry::new());
//! factories.register(SharedValueInstantiator::description());
//!
//! let directory = SharedObjectDirectory::new(Id::unique(), factories);
//! let descriptor = SharedObjectDescriptor::new(Id::from("o1"), SHARED_VALUE)
//!     .with_init_args(json!({"title": "notes"}));
//! directory.create_local(&descriptor).unwrap();
//!
//! assert!(directory.get(&Id::from("o1")).is_ok());
//! assert!(directory.create_local(&descriptor).is_err());
//! ```

pub mod directory;
pub mod error;
pub mod id;
pub mod object;
pub mod registry;

pub use directory::{EntryInfo, EntryState, Listing, SharedObjectDirectory};
pub use error::{AbortSignal, BoxError, CohortError, InstantiationCause, Result};
pub use id::{Id, TransactionId};
pub use object::{SharedObject, SharedObjectDescriptor, SharedValue, SharedValueInstantiator};
pub use registry::{ArgType, Description, DescriptionRegistry, Instantiator};

//! Opaque identifiers for containers, shared objects and transactions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use ulid::Ulid;

/// Globally comparable identifier of a container or a shared object.
///
/// Identifiers are immutable and cheap to clone; they are used as map keys
/// throughout the crate. Generated identifiers are ULIDs, parsed ones keep
/// the caller's string verbatim.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Id(Arc<str>);

impl Id {
    /// Issue a new unique identifier.
    pub fn unique() -> Self {
        Self(Arc::from(Ulid::new().to_string()))
    }

    /// Build an identifier from its external string form.
    pub fn from_string(s: impl AsRef<str>) -> Self {
        Self(Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.0.to_string()
    }
}

/// Identity of one replication transaction.
///
/// Replies are matched on this value, so a late reply for an expired
/// transaction can never be applied to a newer one reusing the object id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Ulid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

//! External reference lookup contract.

use crate::error::LookupError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One entry offered by a reference service for a term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCandidate {
    /// Stable identifier within the service.
    pub id: String,
    pub title: String,
    pub summary: String,
}

/// A service that maps a term to candidate reference entries.
///
/// Implementations perform a single attempt; retries, timeouts and
/// candidate scoring belong to the linker.
#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    async fn lookup(&self, term: &str) -> Result<Vec<ReferenceCandidate>, LookupError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "reference-lookup"
    }
}

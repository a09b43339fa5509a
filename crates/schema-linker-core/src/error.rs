//! Error taxonomy shared by every Schema Linker component.
//!
//! "Nothing relevant found" is not represented here: an empty
//! [`FilteredSchema`](crate::filter::FilteredSchema) is a valid result.

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors raised by schema loading, indexing, embedding and filtering.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Invalid top-K, threshold, hop count, or other caller-supplied setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The index has not been populated for the current schema version.
    #[error("index not initialized: {0}")]
    NotInitialized(String),

    /// Vectors of a different dimension than the ones already stored.
    ///
    /// Happens when the embedding provider changes without clearing the
    /// index. The index must be wiped and fully recomputed.
    #[error("embedding dimension mismatch: index holds {expected}-d vectors, got {actual}-d")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Embedding or rerank backend failure (unavailable, rate limited, timed out).
    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// The schema document references tables or columns it does not define.
    #[error("schema integrity error: {0}")]
    SchemaIntegrity(String),

    /// The index backend failed to read or write.
    #[error("index storage error: {0}")]
    Storage(String),
}

impl LinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// A transient provider failure that is worth retrying.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            retryable: true,
        }
    }

    /// A provider failure that will not go away on retry (bad request, auth).
    pub fn fatal_provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                retryable: true,
                ..
            }
        )
    }
}

use crate::domain::result::DomainResult;
use async_trait::async_trait;

/// Domain entity for a counting result emitted by an upstream counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountingResult {
    /// Identifier of the counter that produced the value
    pub id: String,
    pub count: i64,
    pub producer: Option<String>,
    pub kernel: Option<String>,
    pub framework: Option<String>,
    pub message: Option<String>,
}

impl CountingResult {
    /// Create a counting result with no auxiliary fields
    pub fn new(id: impl Into<String>, count: i64) -> Self {
        Self {
            id: id.into(),
            count,
            producer: None,
            kernel: None,
            framework: None,
            message: None,
        }
    }
}

/// Repository trait for counting result storage
///
/// Implementations must be safe to call concurrently; callers place no
/// locking around `save` and impose no timeout on it.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CountingResultRepository: Send + Sync {
    /// Persist a single counting result
    async fn save(&self, result: &CountingResult) -> DomainResult<()>;
}

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    /// Rendered with its full context chain
    #[error("Repository error: {0:#}")]
    RepositoryError(#[from] anyhow::Error),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("workspace error: {0}")]
    Workspace(String),
}

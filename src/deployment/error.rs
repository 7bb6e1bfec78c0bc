#[derive(Debug, thiserror::Error)]
pub enum DeploymentStoreError {
    #[error("deployment not found")]
    NotFound,

    #[error("failed to create deployment: {0}")]
    CreationFailed(String),

    #[error("failed to load active deployment: {0}")]
    GetActiveFailed(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub mod error;
pub mod model;
pub mod store;

pub use error::DeploymentStoreError;
pub use model::Deployment;

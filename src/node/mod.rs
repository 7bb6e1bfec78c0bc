pub mod error;
pub mod model;
pub mod store;

pub use error::NodeStoreError;
pub use model::{Node, NodeState};

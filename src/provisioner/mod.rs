pub mod error;

pub use error::ProvisionerError;

use crate::node::Node;

/// Abstract capability exposing `start`/`terminate` over the concrete
/// compute backend (container/VM orchestrator). Both calls must be
/// idempotent with respect to the node's id — the supervisor may retry
/// across restarts and concurrent ticks.
#[async_trait::async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Initiate creation of the underlying compute for `node`. The node is
    /// expected to eventually call `NodeStore::register` once it is ready;
    /// this call does not itself wait for that to happen.
    async fn start(&self, node: &Node) -> Result<(), ProvisionerError>;

    /// Initiate shutdown of the underlying compute for `node`. Must
    /// tolerate being called more than once for the same node.
    async fn terminate(&self, node: &Node) -> Result<(), ProvisionerError>;
}

/// Reference provisioner that only logs. Useful as a default when no real
/// backend is wired and as executable documentation of the contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProvisioner;

#[async_trait::async_trait]
impl NodeProvisioner for LoggingProvisioner {
    async fn start(&self, node: &Node) -> Result<(), ProvisionerError> {
        tracing::info!(node_id = node.id, routing_id = %node.routing_id, "provisioner: start");
        Ok(())
    }

    async fn terminate(&self, node: &Node) -> Result<(), ProvisionerError> {
        tracing::info!(node_id = node.id, routing_id = %node.routing_id, "provisioner: terminate");
        Ok(())
    }
}

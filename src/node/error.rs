use super::model::NodeState;

#[derive(Debug, thiserror::Error)]
pub enum NodeStoreError {
    #[error("node not found")]
    NotFound,

    #[error("invalid transition {from} -> {to}")]
    TransitionInvalid { from: NodeState, to: NodeState },

    #[error("node is not in a terminal state")]
    NotTerminal,

    #[error("malformed node row: {0}")]
    MalformedRow(#[from] super::model::UnknownNodeState),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

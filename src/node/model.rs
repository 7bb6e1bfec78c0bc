use chrono::{DateTime, Utc};

/// The fixed state machine from §4.5. Transitions are enforced by
/// [`super::store::transition`] against [`ALLOWED_EDGES`](super::store::ALLOWED_EDGES).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Starting,
    Running,
    Outdated,
    Idle,
    Terminated,
    Error,
}

impl NodeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Outdated => "OUTDATED",
            Self::Idle => "IDLE",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a `nodes.state` column value into a [`NodeState`].
#[derive(Debug, thiserror::Error)]
#[error("unrecognized node state: {0}")]
pub struct UnknownNodeState(pub String);

impl std::str::FromStr for NodeState {
    type Err = UnknownNodeState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "OUTDATED" => Ok(Self::Outdated),
            "IDLE" => Ok(Self::Idle),
            "TERMINATED" => Ok(Self::Terminated),
            "ERROR" => Ok(Self::Error),
            other => Err(UnknownNodeState(other.to_owned())),
        }
    }
}

/// A managed worker instance. Raw rows come back from storage with `state`
/// as text; [`Node::try_from_row`] converts it into the typed [`NodeState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: i64,
    pub routing_id: String,
    pub deployment_id: i64,
    pub state: NodeState,
    pub url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_state_transition_at: DateTime<Utc>,
}

/// Raw row shape as returned by `sqlx`, prior to parsing `state`.
pub(crate) struct NodeRow {
    pub id: i64,
    pub routing_id: String,
    pub deployment_id: i64,
    pub state: String,
    pub url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_state_transition_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for Node {
    type Error = UnknownNodeState;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            routing_id: row.routing_id,
            deployment_id: row.deployment_id,
            state: row.state.parse()?,
            url: row.url,
            error: row.error,
            created_at: row.created_at,
            last_state_transition_at: row.last_state_transition_at,
        })
    }
}

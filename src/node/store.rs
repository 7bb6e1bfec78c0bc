use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::error::NodeStoreError;
use super::model::{Node, NodeRow, NodeState};

/// The only (from, to) pairs `transition` will accept, per §4.5.
pub const ALLOWED_EDGES: &[(NodeState, NodeState)] = &[
    (NodeState::Pending, NodeState::Starting),
    (NodeState::Pending, NodeState::Error),
    (NodeState::Starting, NodeState::Running),
    (NodeState::Starting, NodeState::Error),
    (NodeState::Running, NodeState::Outdated),
    (NodeState::Running, NodeState::Idle),
    (NodeState::Running, NodeState::Error),
    (NodeState::Outdated, NodeState::Idle),
    (NodeState::Idle, NodeState::Terminated),
    (NodeState::Idle, NodeState::Error),
];

fn edge_allowed(from: NodeState, to: NodeState) -> bool {
    ALLOWED_EDGES.contains(&(from, to))
}

/// Create a node in `PENDING` for the given logical slot and deployment.
#[tracing::instrument(skip(pool), err)]
pub async fn create(
    pool: &PgPool,
    routing_id: &str,
    deployment_id: i64,
) -> Result<Node, NodeStoreError> {
    let row = sqlx::query_as!(
        NodeRow,
        r#"
        INSERT INTO nodes (routing_id, deployment_id, state, created_at, last_state_transition_at)
        VALUES ($1, $2, 'PENDING', now(), now())
        RETURNING id, routing_id, deployment_id, state, url, error, created_at, last_state_transition_at
        "#,
        routing_id,
        deployment_id,
    )
    .fetch_one(pool)
    .await?;

    tracing::info!(node_id = row.id, %routing_id, deployment_id, "node created");
    Ok(Node::try_from(row)?)
}

/// Fetch a single node by id.
#[tracing::instrument(skip(pool), err)]
pub async fn get(pool: &PgPool, id: i64) -> Result<Node, NodeStoreError> {
    let row = sqlx::query_as!(
        NodeRow,
        r#"
        SELECT id, routing_id, deployment_id, state, url, error, created_at, last_state_transition_at
        FROM nodes WHERE id = $1
        "#,
        id,
    )
    .fetch_optional(pool)
    .await?
    .ok_or(NodeStoreError::NotFound)?;

    Ok(Node::try_from(row)?)
}

/// Predicate combination supported by [`search`].
#[derive(Debug, Default, Clone)]
pub struct SearchParams {
    pub states: Option<Vec<NodeState>>,
    pub deployment_id: Option<i64>,
    pub routing_id: Option<String>,
    pub older_than: Option<DateTime<Utc>>,
}

/// `routing_id -> state -> nodes`, the shape the supervisor needs for
/// per-slot rollover bookkeeping.
pub type GroupedNodes = HashMap<String, HashMap<NodeState, Vec<Node>>>;

/// Search nodes by any combination of state set, deployment, routing id, and
/// `last_state_transition_at` age, grouped by routing id then state. Optional
/// predicates use the `$N::type IS NULL OR ...` pattern so a single static
/// query covers every combination of filters.
#[tracing::instrument(skip(pool, params), err)]
pub async fn search(pool: &PgPool, params: &SearchParams) -> Result<GroupedNodes, NodeStoreError> {
    let states = params
        .states
        .as_ref()
        .map(|states| states.iter().map(|s| s.as_str()).collect::<Vec<_>>());

    let rows = sqlx::query_as!(
        NodeRow,
        r#"
        SELECT id, routing_id, deployment_id, state, url, error, created_at, last_state_transition_at
        FROM nodes
        WHERE ($1::text[] IS NULL OR state = ANY($1))
          AND ($2::bigint IS NULL OR deployment_id = $2)
          AND ($3::text IS NULL OR routing_id = $3)
          AND ($4::timestamptz IS NULL OR last_state_transition_at < $4)
        "#,
        states.as_deref(),
        params.deployment_id,
        params.routing_id,
        params.older_than,
    )
    .fetch_all(pool)
    .await?;

    let mut grouped: GroupedNodes = HashMap::new();
    for row in rows {
        let node = Node::try_from(row)?;
        grouped
            .entry(node.routing_id.clone())
            .or_default()
            .entry(node.state)
            .or_default()
            .push(node);
    }

    Ok(grouped)
}

/// Optional fields set alongside a transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionUpdate {
    pub url: Option<String>,
    pub error: Option<String>,
}

/// Conditionally move a node from `from` to `to`, iff both the edge is in
/// [`ALLOWED_EDGES`] and the node's current state equals `from`. This is the
/// sole mutation primitive; it serializes concurrent mutators because the
/// `UPDATE ... WHERE state = $from` only matches for the single caller that
/// observes the pre-transition state.
#[tracing::instrument(skip(pool, update), err)]
pub async fn transition(
    pool: &PgPool,
    id: i64,
    from: NodeState,
    to: NodeState,
    update: TransitionUpdate,
) -> Result<Node, NodeStoreError> {
    if !edge_allowed(from, to) {
        return Err(NodeStoreError::TransitionInvalid { from, to });
    }

    let row = sqlx::query_as!(
        NodeRow,
        r#"
        UPDATE nodes
        SET state = $3,
            url = COALESCE($4, url),
            error = COALESCE($5, error),
            last_state_transition_at = now()
        WHERE id = $1 AND state = $2
        RETURNING id, routing_id, deployment_id, state, url, error, created_at, last_state_transition_at
        "#,
        id,
        from.as_str(),
        to.as_str(),
        update.url,
        update.error,
    )
    .fetch_optional(pool)
    .await?
    .ok_or(NodeStoreError::TransitionInvalid { from, to })?;

    tracing::debug!(node_id = id, %from, %to, "node transitioned");
    Ok(Node::try_from(row)?)
}

/// `STARTING -> RUNNING`, setting `url` atomically. The node-self-registration
/// call described in §4.3.
#[tracing::instrument(skip(pool, url), err)]
pub async fn register(pool: &PgPool, id: i64, url: &str) -> Result<Node, NodeStoreError> {
    transition(
        pool,
        id,
        NodeState::Starting,
        NodeState::Running,
        TransitionUpdate {
            url: Some(url.to_owned()),
            error: None,
        },
    )
    .await
}

/// `RUNNING -> IDLE`, triggered by the runtime when a node drains.
#[tracing::instrument(skip(pool), err)]
pub async fn idle(pool: &PgPool, id: i64) -> Result<Node, NodeStoreError> {
    transition(
        pool,
        id,
        NodeState::Running,
        NodeState::Idle,
        TransitionUpdate::default(),
    )
    .await
}

/// Delete a node row. Only callable from a terminal state.
#[tracing::instrument(skip(pool), err)]
pub async fn remove(pool: &PgPool, id: i64) -> Result<(), NodeStoreError> {
    let node = get(pool, id).await?;
    if !node.state.is_terminal() {
        return Err(NodeStoreError::NotTerminal);
    }

    sqlx::query!("DELETE FROM nodes WHERE id = $1", id)
        .execute(pool)
        .await?;

    tracing::info!(node_id = id, "node removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment;

    async fn active_deployment(pool: &PgPool) -> i64 {
        deployment::store::create(pool, &"f".repeat(40))
            .await
            .unwrap()
            .id
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn create_starts_pending(pool: PgPool) {
        let deployment_id = active_deployment(&pool).await;
        let node = create(&pool, "slot-a", deployment_id).await.unwrap();
        assert_eq!(node.state, NodeState::Pending);
        assert!(node.url.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn transition_rejects_bad_edge(pool: PgPool) {
        let deployment_id = active_deployment(&pool).await;
        let node = create(&pool, "slot-a", deployment_id).await.unwrap();
        let err = transition(
            &pool,
            node.id,
            NodeState::Pending,
            NodeState::Running,
            TransitionUpdate::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeStoreError::TransitionInvalid { .. }));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn transition_rejects_stale_from_state(pool: PgPool) {
        let deployment_id = active_deployment(&pool).await;
        let node = create(&pool, "slot-a", deployment_id).await.unwrap();
        transition(
            &pool,
            node.id,
            NodeState::Pending,
            NodeState::Starting,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();

        // Now the node is STARTING; a second PENDING -> STARTING attempt must fail.
        let err = transition(
            &pool,
            node.id,
            NodeState::Pending,
            NodeState::Starting,
            TransitionUpdate::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeStoreError::TransitionInvalid { .. }));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn register_sets_url_and_running(pool: PgPool) {
        let deployment_id = active_deployment(&pool).await;
        let node = create(&pool, "slot-a", deployment_id).await.unwrap();
        transition(
            &pool,
            node.id,
            NodeState::Pending,
            NodeState::Starting,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();

        let registered = register(&pool, node.id, "http://10.0.0.1:9000").await.unwrap();
        assert_eq!(registered.state, NodeState::Running);
        assert_eq!(registered.url.as_deref(), Some("http://10.0.0.1:9000"));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn remove_rejects_non_terminal(pool: PgPool) {
        let deployment_id = active_deployment(&pool).await;
        let node = create(&pool, "slot-a", deployment_id).await.unwrap();
        let err = remove(&pool, node.id).await.unwrap_err();
        assert!(matches!(err, NodeStoreError::NotTerminal));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn remove_deletes_terminal_node(pool: PgPool) {
        let deployment_id = active_deployment(&pool).await;
        let node = create(&pool, "slot-a", deployment_id).await.unwrap();
        transition(
            &pool,
            node.id,
            NodeState::Pending,
            NodeState::Error,
            TransitionUpdate {
                url: None,
                error: Some("boom".into()),
            },
        )
        .await
        .unwrap();

        remove(&pool, node.id).await.unwrap();
        let err = get(&pool, node.id).await.unwrap_err();
        assert!(matches!(err, NodeStoreError::NotFound));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn search_groups_by_routing_id_and_state(pool: PgPool) {
        let deployment_id = active_deployment(&pool).await;
        create(&pool, "slot-a", deployment_id).await.unwrap();
        create(&pool, "slot-a", deployment_id).await.unwrap();
        create(&pool, "slot-b", deployment_id).await.unwrap();

        let grouped = search(
            &pool,
            &SearchParams {
                deployment_id: Some(deployment_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(grouped["slot-a"][&NodeState::Pending].len(), 2);
        assert_eq!(grouped["slot-b"][&NodeState::Pending].len(), 1);
    }
}

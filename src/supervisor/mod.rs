use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use sqlx::PgPool;

use crate::config::StateTimeouts;
use crate::deployment;
use crate::node::store::{self, SearchParams, TransitionUpdate};
use crate::node::{Node, NodeState};
use crate::provisioner::NodeProvisioner;

/// How many node mutations a single tick step may have in flight at once.
/// Suspension only happens at I/O boundaries (§5); this just bounds fan-out.
const STEP_CONCURRENCY: usize = 16;

/// Per-tick outcome counts, useful for tests and for logging a tick summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub started: u32,
    pub start_failed: u32,
    pub starting_timed_out: u32,
    pub marked_outdated: u32,
    pub replacements_created: u32,
    pub outdated_escalated: u32,
    pub terminated: u32,
    pub terminate_failed: u32,
    pub idle_timed_out: u32,
    pub garbage_collected: u32,
}

enum Outcome {
    Terminated,
    Failed,
    TimedOut,
}

/// The reconciliation engine described in §4.5. Owns no mutable state beyond
/// its store and provisioner handles — the database is the only source of
/// truth, so `tick()` may be called concurrently by multiple supervisor
/// processes (§5) without coordination beyond the conditional `transition`.
#[derive(Clone)]
pub struct Supervisor {
    pool: PgPool,
    provisioner: Arc<dyn NodeProvisioner>,
    timeouts: StateTimeouts,
}

impl Supervisor {
    #[must_use]
    pub fn new(pool: PgPool, provisioner: Arc<dyn NodeProvisioner>, timeouts: StateTimeouts) -> Self {
        Self {
            pool,
            provisioner,
            timeouts,
        }
    }

    /// Run one reconciliation pass. Never returns an error: per §7, a single
    /// node's or step's storage/provisioner failure is isolated and logged,
    /// not propagated, so the tick always completes and the next tick gets
    /// a fresh chance.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let active = match deployment::store::get_active(&self.pool).await {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load active deployment; skipping deployment-dependent steps");
                None
            }
        };
        if active.is_none() {
            tracing::warn!("no active deployment; skipping deployment-dependent steps");
        }

        self.start_pending(&mut report).await;
        self.timeout_starting(&mut report).await;

        if let Some(active) = &active {
            self.mark_outdated(active.id, &mut report).await;
            self.replace_outdated(active.id, &mut report).await;
        }

        self.escalate_outdated(&mut report).await;
        self.terminate_idle(&mut report).await;
        self.garbage_collect(&mut report).await;

        tracing::info!(?report, "tick complete");
        report
    }

    /// Step 2: call `provisioner.start` for every `PENDING` node and advance
    /// it to `STARTING`, or to `ERROR` on a terminal provisioner failure.
    async fn start_pending(&self, report: &mut TickReport) {
        let Some(pending) = self.nodes_in(NodeState::Pending).await else {
            return;
        };

        let results: Vec<bool> = stream::iter(pending)
            .map(|node| async move {
                match self.provisioner.start(&node).await {
                    Ok(()) => {
                        let res = store::transition(
                            &self.pool,
                            node.id,
                            NodeState::Pending,
                            NodeState::Starting,
                            TransitionUpdate::default(),
                        )
                        .await;
                        log_transition_err(&res, node.id);
                        true
                    }
                    Err(e) if e.is_terminal() => {
                        tracing::warn!(node_id = node.id, error = %e, "start failed permanently");
                        let res = store::transition(
                            &self.pool,
                            node.id,
                            NodeState::Pending,
                            NodeState::Error,
                            TransitionUpdate {
                                url: None,
                                error: Some(e.to_string()),
                            },
                        )
                        .await;
                        log_transition_err(&res, node.id);
                        false
                    }
                    Err(e) => {
                        tracing::warn!(node_id = node.id, error = %e, "start failed, will retry");
                        false
                    }
                }
            })
            .buffer_unordered(STEP_CONCURRENCY)
            .collect()
            .await;

        for started in results {
            if started {
                report.started += 1;
            } else {
                report.start_failed += 1;
            }
        }
    }

    /// Step 3: `STARTING` nodes stuck past the configured timeout go to `ERROR`.
    async fn timeout_starting(&self, report: &mut TickReport) {
        let cutoff = Utc::now() - self.timeouts.starting;
        let Some(stuck) = self.nodes_older_than(NodeState::Starting, cutoff).await else {
            return;
        };

        let count = stream::iter(stuck)
            .map(|node| async move {
                store::transition(
                    &self.pool,
                    node.id,
                    NodeState::Starting,
                    NodeState::Error,
                    TransitionUpdate {
                        url: None,
                        error: Some("startup_timeout".into()),
                    },
                )
                .await
            })
            .buffer_unordered(STEP_CONCURRENCY)
            .filter_map(|res| async move {
                log_transition_err(&res, 0);
                res.ok()
            })
            .count()
            .await;

        report.starting_timed_out += count as u32;
    }

    /// Step 4: `RUNNING` nodes whose deployment isn't the active one go to `OUTDATED`.
    async fn mark_outdated(&self, active_deployment_id: i64, report: &mut TickReport) {
        let Some(running) = self.nodes_in(NodeState::Running).await else {
            return;
        };

        let count = stream::iter(
            running
                .into_iter()
                .filter(|n| n.deployment_id != active_deployment_id),
        )
        .map(|node| async move {
            store::transition(
                &self.pool,
                node.id,
                NodeState::Running,
                NodeState::Outdated,
                TransitionUpdate::default(),
            )
            .await
        })
        .buffer_unordered(STEP_CONCURRENCY)
        .filter_map(|res| async move {
            log_transition_err(&res, 0);
            res.ok()
        })
        .count()
        .await;

        report.marked_outdated += count as u32;
    }

    /// Step 5: for each routing id with no `PENDING`/`STARTING`/`RUNNING`
    /// node on the active deployment, create one, preserving the slot.
    async fn replace_outdated(&self, active_deployment_id: i64, report: &mut TickReport) {
        let grouped = match store::search(&self.pool, &store::SearchParams::default()).await {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(error = %e, "failed to search nodes for rollover");
                return;
            }
        };

        for (routing_id, by_state) in grouped {
            let has_live_on_active = [NodeState::Pending, NodeState::Starting, NodeState::Running]
                .iter()
                .any(|state| {
                    by_state
                        .get(state)
                        .is_some_and(|nodes| nodes.iter().any(|n| n.deployment_id == active_deployment_id))
                });

            if has_live_on_active {
                continue;
            }

            match store::create(&self.pool, &routing_id, active_deployment_id).await {
                Ok(node) => {
                    tracing::info!(node_id = node.id, %routing_id, "replacement node created");
                    report.replacements_created += 1;
                }
                Err(e) => tracing::error!(error = %e, %routing_id, "failed to create replacement node"),
            }
        }
    }

    /// `OUTDATED` nodes normally leave that state when the runtime signals
    /// its drain is complete. A node stuck `OUTDATED` past the configured
    /// grace period is escalated straight to `IDLE` so termination proceeds
    /// even if the runtime never reports back.
    async fn escalate_outdated(&self, report: &mut TickReport) {
        let cutoff = Utc::now() - self.timeouts.outdated;
        let Some(stuck) = self.nodes_older_than(NodeState::Outdated, cutoff).await else {
            return;
        };

        let count = stream::iter(stuck)
            .map(|node| async move {
                store::transition(
                    &self.pool,
                    node.id,
                    NodeState::Outdated,
                    NodeState::Idle,
                    TransitionUpdate::default(),
                )
                .await
            })
            .buffer_unordered(STEP_CONCURRENCY)
            .filter_map(|res| async move {
                log_transition_err(&res, 0);
                res.ok()
            })
            .count()
            .await;

        report.outdated_escalated += count as u32;
    }

    /// Step 6: call `provisioner.terminate` for every `IDLE` node and advance
    /// it to `TERMINATED` on success. A node whose terminate keeps failing
    /// past the `IDLE` retry budget (`timeouts.idle`, measured against
    /// `last_state_transition_at`) escalates to `ERROR` instead of retrying
    /// forever — otherwise it would sit outside garbage collection's reach
    /// indefinitely.
    async fn terminate_idle(&self, report: &mut TickReport) {
        let Some(idle) = self.nodes_in(NodeState::Idle).await else {
            return;
        };

        let retry_budget_expired = Utc::now() - self.timeouts.idle;

        let results: Vec<Outcome> = stream::iter(idle)
            .map(|node| async move {
                match self.provisioner.terminate(&node).await {
                    Ok(()) => {
                        let res = store::transition(
                            &self.pool,
                            node.id,
                            NodeState::Idle,
                            NodeState::Terminated,
                            TransitionUpdate::default(),
                        )
                        .await;
                        log_transition_err(&res, node.id);
                        Outcome::Terminated
                    }
                    Err(e) if node.last_state_transition_at < retry_budget_expired => {
                        tracing::warn!(node_id = node.id, error = %e, "terminate retry budget exhausted");
                        let res = store::transition(
                            &self.pool,
                            node.id,
                            NodeState::Idle,
                            NodeState::Error,
                            TransitionUpdate {
                                url: None,
                                error: Some(e.to_string()),
                            },
                        )
                        .await;
                        log_transition_err(&res, node.id);
                        Outcome::TimedOut
                    }
                    Err(e) => {
                        tracing::warn!(node_id = node.id, error = %e, "terminate failed, will retry");
                        Outcome::Failed
                    }
                }
            })
            .buffer_unordered(STEP_CONCURRENCY)
            .collect()
            .await;

        for outcome in results {
            match outcome {
                Outcome::Terminated => report.terminated += 1,
                Outcome::Failed => report.terminate_failed += 1,
                Outcome::TimedOut => report.idle_timed_out += 1,
            }
        }
    }

    /// Step 7: remove `TERMINATED`/`ERROR` nodes past their terminal timeout.
    async fn garbage_collect(&self, report: &mut TickReport) {
        for (state, timeout) in [
            (NodeState::Terminated, self.timeouts.terminated),
            (NodeState::Error, self.timeouts.error),
        ] {
            let cutoff = Utc::now() - timeout;
            let Some(stale) = self.nodes_older_than(state, cutoff).await else {
                continue;
            };

            let count = stream::iter(stale)
                .map(|node| async move { store::remove(&self.pool, node.id).await })
                .buffer_unordered(STEP_CONCURRENCY)
                .filter_map(|res| async move {
                    if let Err(e) = &res {
                        tracing::error!(error = %e, "failed to garbage-collect node");
                    }
                    res.ok()
                })
                .count()
                .await;

            report.garbage_collected += count as u32;
        }
    }

    async fn nodes_in(&self, state: NodeState) -> Option<Vec<Node>> {
        let params = SearchParams {
            states: Some(vec![state]),
            ..Default::default()
        };
        match store::search(&self.pool, &params).await {
            Ok(grouped) => Some(flatten(grouped)),
            Err(e) => {
                tracing::error!(error = %e, ?state, "failed to search nodes");
                None
            }
        }
    }

    async fn nodes_older_than(
        &self,
        state: NodeState,
        cutoff: chrono::DateTime<Utc>,
    ) -> Option<Vec<Node>> {
        let params = SearchParams {
            states: Some(vec![state]),
            older_than: Some(cutoff),
            ..Default::default()
        };
        match store::search(&self.pool, &params).await {
            Ok(grouped) => Some(flatten(grouped)),
            Err(e) => {
                tracing::error!(error = %e, ?state, "failed to search nodes");
                None
            }
        }
    }
}

fn flatten(grouped: store::GroupedNodes) -> Vec<Node> {
    grouped
        .into_values()
        .flat_map(std::collections::HashMap::into_values)
        .flatten()
        .collect()
}

fn log_transition_err(res: &Result<Node, crate::node::NodeStoreError>, node_id: i64) {
    if let Err(e) = res {
        // A lost race (NodeStoreError::TransitionInvalid) is benign under
        // concurrent supervisors (§5); anything else is worth a louder log.
        match e {
            crate::node::NodeStoreError::TransitionInvalid { .. } => {
                tracing::debug!(node_id, error = %e, "transition lost a race");
            }
            _ => tracing::error!(node_id, error = %e, "transition failed"),
        }
    }
}

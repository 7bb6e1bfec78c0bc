use std::time::Duration;

use crate::supervisor::Supervisor;

/// Background task that invokes `supervisor.tick()` at a fixed interval.
/// Ticks never overlap: the loop awaits one tick to completion before
/// sleeping for the next, matching the "serial ticks" requirement in §5.
/// Mirrors the shutdown-on-watch-channel pattern used throughout the
/// platform's other background loops (deployer reconciler, agent reaper).
pub async fn run(
    supervisor: Supervisor,
    tick_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    tracing::info!(?tick_interval, "fleet supervisor scheduler started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("fleet supervisor scheduler shutting down");
                break;
            }
            () = tokio::time::sleep(tick_interval) => {
                let _report = supervisor.tick().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::{NodeProvisioner, ProvisionerError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvisioner(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl NodeProvisioner for CountingProvisioner {
        async fn start(&self, _node: &crate::node::Node) -> Result<(), ProvisionerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn terminate(&self, _node: &crate::node::Node) -> Result<(), ProvisionerError> {
            Ok(())
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn scheduler_stops_on_shutdown_signal(pool: sqlx::PgPool) {
        let calls = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(
            pool,
            Arc::new(CountingProvisioner(calls.clone())),
            crate::config::StateTimeouts::default(),
        );

        let (tx, rx) = tokio::sync::watch::channel(());
        let handle = tokio::spawn(run(supervisor, Duration::from_millis(5), rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop after shutdown signal")
            .unwrap();
    }
}

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::pool::AgentProcessPool;

#[derive(Debug)]
/// Background task that periodically reaps idle agent sessions.
pub struct AgentIdleSweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AgentIdleSweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl AgentProcessPool {
    /// Starts reaping idle sessions every `sweep_interval`.
    pub fn spawn_idle_sweeper(&self) -> AgentIdleSweeperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(run_idle_sweep_loop(self.clone(), shutdown_rx));
        AgentIdleSweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

async fn run_idle_sweep_loop(pool: AgentProcessPool, mut shutdown_rx: oneshot::Receiver<()>) {
    let period = pool.config().sweep_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let reaped = pool.reap_idle_sessions().await;
                if !reaped.is_empty() {
                    tracing::debug!(reaped = reaped.len(), "idle agent sweep finished");
                }
            }
            _ = &mut shutdown_rx => break,
        }
    }
}

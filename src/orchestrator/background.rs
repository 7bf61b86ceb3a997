//! Periodic background work.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Running background tasks and their shutdown signal.
pub(super) struct Background {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Background {
    pub(super) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// Run `tick` every `every` until shutdown. The first run happens one
    /// interval after spawning.
    pub(super) fn every<F, Fut>(&mut self, name: &'static str, every: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(task = name, "background task stopped");
        });
    }

    pub(super) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Signal shutdown and wait for every task to finish its current tick.
    pub(super) async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        while self.tasks.join_next().await.is_some() {}
    }
}

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};

use super::VerificationTokenStore;

/// Spawn a background task that evicts expired tokens every `interval`.
///
/// Lookups already treat expired entries as absent; the sweep only keeps
/// tokens nobody clicked from piling up.
pub fn spawn_sweeper(
    store: Arc<VerificationTokenStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let interval = if interval.is_zero() {
        Duration::from_secs(1)
    } else {
        interval
    };

    tokio::spawn(async move {
        loop {
            sleep(interval).await;

            match store.sweep_expired().await {
                Ok(0) => {}
                Ok(evicted) => debug!(evicted, "swept expired verification tokens"),
                Err(err) => error!("verification token sweep failed: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::Payload;

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_tokens() -> anyhow::Result<()> {
        let ttl = Duration::from_secs(60);
        let store = Arc::new(VerificationTokenStore::memory(ttl));
        store.issue("alice@example.com", Payload::new()).await?;

        let handle = spawn_sweeper(Arc::clone(&store), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(store.len().await?, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.len().await?, 0);

        handle.abort();
        Ok(())
    }
}

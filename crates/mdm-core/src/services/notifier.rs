use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::engine::EngineEvent;

/// Desktop notification / UI push. May be unavailable; the engine never
/// waits on it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &EngineEvent) -> Result<()>;
}

/// Forward a subscription to `notifier` on its own task until the engine
/// goes away. Failures and lag are logged and skipped.
pub fn spawn_notifier(
    mut events: broadcast::Receiver<EngineEvent>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = notifier.notify(&event).await {
                        tracing::debug!(job_id = %event.job_id(), "notifier unavailable: {:#}", e);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("notifier fell behind; skipped {} events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, event: &EngineEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.job_id().to_string());
            if event.job_id() == "bad" {
                anyhow::bail!("no display");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn forwards_until_sender_closes_and_survives_errors() {
        let (tx, rx) = broadcast::channel(8);
        let rec = Arc::new(Recording::default());
        let task = spawn_notifier(rx, rec.clone());
        for id in ["a", "bad", "b"] {
            tx.send(EngineEvent::Removed { id: id.to_string() }).unwrap();
        }
        drop(tx);
        task.await.unwrap();
        assert_eq!(*rec.seen.lock().unwrap(), vec!["a", "bad", "b"]);
    }
}

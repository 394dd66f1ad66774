//! Ordered hand-off of streamed output units to the caller.
//!
//! A bounded queue sits between the parser and one delivery task. The task
//! awaits each [`OutputSink::deliver`] before taking the next unit, so units
//! reach the sink in parse order even when the sink is slow, and a full
//! queue pushes back on the reader.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::ContainerOutput;

/// Queue depth between the stdout reader and the sink.
pub const DELIVERY_QUEUE_DEPTH: usize = 32;

/// Receives streamed output units, one at a time, in order.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, output: ContainerOutput);
}

#[async_trait]
impl<F, Fut> OutputSink for F
where
    F: Fn(ContainerOutput) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn deliver(&self, output: ContainerOutput) {
        (self)(output).await
    }
}

pub struct OutputDelivery {
    tx: mpsc::Sender<ContainerOutput>,
    task: JoinHandle<usize>,
}

impl OutputDelivery {
    pub fn spawn(sink: Arc<dyn OutputSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ContainerOutput>(DELIVERY_QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            let mut delivered = 0usize;
            while let Some(output) = rx.recv().await {
                sink.deliver(output).await;
                delivered += 1;
            }
            delivered
        });
        Self { tx, task }
    }

    /// Queue a unit, waiting for room if the sink is behind.
    pub async fn enqueue(&self, output: ContainerOutput) {
        if self.tx.send(output).await.is_err() {
            tracing::warn!("Output delivery task is gone, dropping streamed unit");
        }
    }

    /// Close the queue and wait until every queued unit was delivered.
    /// Returns the number of units delivered.
    pub async fn finish(self) -> usize {
        drop(self.tx);
        match self.task.await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Output delivery task failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn test_slow_sink_receives_units_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = move |output: ContainerOutput| {
            let seen = Arc::clone(&sink_seen);
            async move {
                let n: u64 = output
                    .result
                    .as_deref()
                    .and_then(|r| r.parse().ok())
                    .unwrap_or(0);
                // Earlier units sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(n))).await;
                seen.lock().await.push(n);
            }
        };

        let delivery = OutputDelivery::spawn(Arc::new(sink));
        for i in 0..10u64 {
            delivery
                .enqueue(ContainerOutput::success(Some(i.to_string()), None))
                .await;
        }
        let delivered = delivery.finish().await;

        assert_eq!(delivered, 10);
        assert_eq!(*seen.lock().await, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_finish_with_nothing_queued() {
        let delivery = OutputDelivery::spawn(Arc::new(|_: ContainerOutput| async {}));
        assert_eq!(delivery.finish().await, 0);
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kafka::consumer::GroupConsumer;
use crate::processor::EventProcessor;
use crate::worker_pool::WorkerPool;

/// Owns the pieces of the ingestion pipeline and their shared shutdown token.
pub struct Pipeline {
    consumer: GroupConsumer,
    pool: WorkerPool,
    processor: Arc<EventProcessor>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        consumer: GroupConsumer,
        processor: EventProcessor,
        pool_size: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            consumer,
            pool: WorkerPool::new(pool_size),
            processor: Arc::new(processor),
            shutdown: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Consume until the shutdown token is cancelled, then give in-flight
    /// messages up to `shutdown_timeout` to finish.
    pub async fn run(&self) {
        info!(
            "Starting pipeline with {} workers",
            self.pool.size()
        );

        self.consumer
            .run(self.shutdown.clone(), &self.pool, self.processor.clone())
            .await;

        info!(
            "Waiting up to {:?} for {} in-flight messages",
            self.shutdown_timeout,
            self.pool.in_flight()
        );
        if !self.pool.drain(self.shutdown_timeout).await {
            warn!("Shutdown timeout reached with messages still in flight");
        }

        self.consumer.flush();
        info!("Pipeline stopped");
    }

    /// Run until `signal` resolves or the token is cancelled from elsewhere.
    pub async fn run_until<F>(&self, signal: F)
    where
        F: Future<Output = ()>,
    {
        let run = self.run();
        tokio::pin!(run);
        tokio::pin!(signal);

        tokio::select! {
            _ = &mut run => return,
            _ = &mut signal => {
                info!("Shutdown signal received");
                self.shutdown.cancel();
            }
        }

        run.await;
    }
}

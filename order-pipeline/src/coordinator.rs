//! The Pipeline Coordinator: a pool of consumption workers feeding the
//! writer, and the shutdown sequence that settles every pulled message.
//!
//! A message moves through `pulled -> parsed -> batched -> flushed`, or ends
//! up dead-lettered after parsing or after its batch failed. Workers only
//! ack rejected messages themselves; batched messages are settled by the
//! writer once their batch reaches a terminal state.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health::{HealthHandle, HealthRegistry};
use order_common::dead_letter::{DeadLetterRecord, DeadLetterSink};
use order_common::parse::parse;
use order_common::queue::{Message, QueueError, Subscription};
use order_common::retry::RetryPolicy;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::writer::{PendingEvent, Writer, WriterHandle};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub worker_pool_size: usize,
    /// How long a worker keeps retrying an unreachable queue before exiting
    pub queue_grace_period: Duration,
    /// Backoff between pulls while the queue is failing
    pub retry_policy: RetryPolicy,
    /// Deadline for each worker's liveness reports
    pub liveness_deadline: Duration,
}

pub struct Coordinator {
    subscription: Arc<dyn Subscription>,
    dead_letters: Arc<dyn DeadLetterSink>,
    writer: Writer,
    config: CoordinatorConfig,
    liveness: HealthRegistry,
    /// Cancelled by the writer when the sink is down past its grace period
    fatal: CancellationToken,
}

impl Coordinator {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        dead_letters: Arc<dyn DeadLetterSink>,
        writer: Writer,
        config: CoordinatorConfig,
        liveness: HealthRegistry,
        fatal: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            dead_letters,
            writer,
            config,
            liveness,
            fatal,
        }
    }

    /// Run the worker pool until `shutdown` is cancelled or a fatal condition
    /// ends it, then tear everything down in order: stop pulling, let
    /// in-flight messages reach the writer, force-flush the open batch and
    /// only then release the subscription.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let stop = CancellationToken::new();
        let busy = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();

        for id in 0..self.config.worker_pool_size {
            let liveness = self
                .liveness
                .register(format!("worker-{id}"), self.config.liveness_deadline)
                .await;
            let worker = Worker {
                id,
                subscription: self.subscription.clone(),
                dead_letters: self.dead_letters.clone(),
                writer: self.writer.handle(),
                config: self.config.clone(),
                liveness,
                busy: busy.clone(),
            };
            workers.spawn(worker.run(stop.clone()));
        }
        info!("started {} workers", self.config.worker_pool_size);

        let mut alive = self.config.worker_pool_size;
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break Ok(());
                }
                _ = self.fatal.cancelled() => break Err(PipelineError::SinkUnavailable),
                Some(joined) = workers.join_next() => {
                    alive -= 1;
                    let error = match joined {
                        Ok(Ok(())) => QueueError::Closed,
                        Ok(Err(e)) => e,
                        Err(e) => QueueError::Unavailable(format!("worker panicked: {e}")),
                    };
                    error!("worker exited, {} still running: {}", alive, error);
                    if alive == 0 {
                        break Err(PipelineError::QueueUnavailable(error));
                    }
                }
            }
        };

        stop.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker task failed during shutdown: {}", e);
            }
        }
        debug!("all workers stopped");

        self.writer.close().await?;

        if let Err(e) = self.subscription.close().await {
            error!("failed to close subscription: {}", e);
        }
        info!("pipeline stopped");

        result
    }
}

struct Worker {
    id: usize,
    subscription: Arc<dyn Subscription>,
    dead_letters: Arc<dyn DeadLetterSink>,
    writer: WriterHandle,
    config: CoordinatorConfig,
    liveness: HealthHandle,
    busy: Arc<AtomicUsize>,
}

impl Worker {
    /// Pull and process messages until stopped. Returns an error when the
    /// queue stayed unreachable for longer than the grace period.
    async fn run(self, stop: CancellationToken) -> Result<(), QueueError> {
        let mut failing_since: Option<Instant> = None;
        let mut failures: u32 = 0;

        loop {
            self.liveness.report_healthy().await;

            let pulled = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                pulled = self.subscription.pull() => pulled,
            };

            match pulled {
                Ok(Some(message)) => {
                    failing_since = None;
                    failures = 0;
                    self.report_saturation(self.busy.fetch_add(1, Ordering::SeqCst) + 1);
                    self.process(message).await;
                    self.report_saturation(self.busy.fetch_sub(1, Ordering::SeqCst) - 1);
                }
                Ok(None) => {
                    failing_since = None;
                    failures = 0;
                }
                Err(QueueError::Closed) => return Err(QueueError::Closed),
                Err(error) => {
                    metrics::counter!("order_pipeline_queue_errors_total").increment(1);
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.config.queue_grace_period {
                        error!(
                            worker = self.id,
                            "queue unreachable for {:?}, giving up: {}",
                            since.elapsed(),
                            error
                        );
                        self.liveness
                            .report_unhealthy(format!("queue unreachable: {error}"))
                            .await;
                        return Err(error);
                    }

                    let backoff = self.config.retry_policy.time_until_next_retry(failures, None);
                    failures = failures.saturating_add(1);
                    warn!(worker = self.id, ?backoff, "failed to pull: {}", error);
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, message: Message) {
        metrics::counter!("order_pipeline_messages_pulled_total").increment(1);
        if let Some(published_at) = message.published_at {
            let lag = (Utc::now() - published_at).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!("order_pipeline_consumption_lag_seconds").record(lag);
        }

        let Message {
            payload, delivery, ..
        } = message;

        match parse(&payload) {
            Ok(event) => {
                let pending = PendingEvent {
                    event,
                    payload,
                    delivery,
                };
                if let Err(e) = self.writer.submit(pending).await {
                    warn!(worker = self.id, "message not batched: {}", e);
                }
            }
            Err(reason) => {
                warn!(
                    worker = self.id,
                    reason = reason.code(),
                    delivery = delivery.id(),
                    "rejected message: {}",
                    reason
                );
                let record = DeadLetterRecord::rejected(payload, &reason);
                match self.dead_letters.record(vec![record]).await {
                    Ok(()) => {
                        metrics::counter!("order_pipeline_dead_letter_total", "reason" => reason.code())
                            .increment(1);
                        if let Err(e) = delivery.ack() {
                            error!(worker = self.id, "failed to ack rejected message: {}", e);
                        }
                    }
                    Err(e) => {
                        error!(worker = self.id, "failed to record dead letter, nacking: {}", e);
                        if let Err(e) = delivery.nack() {
                            error!(worker = self.id, "failed to nack message: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Share of the pool currently processing a message rather than waiting on a pull.
    fn report_saturation(&self, busy: usize) {
        metrics::gauge!("order_pipeline_worker_saturation_percent")
            .set(100.0 * busy as f64 / self.config.worker_pool_size as f64);
    }
}

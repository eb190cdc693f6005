//! The Batching Writer: the single owner of open and sealed batches.
//!
//! Workers submit parsed events over a bounded channel to the batching task.
//! That task seals a batch on a count, byte or age threshold and hands it to
//! the flush task over a channel of capacity one, so at most one flush is in
//! flight while the next batch accumulates. The flush task settles every
//! message of a batch: ack after a successful write, or dead-letter then ack
//! when the write cannot succeed.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use health::HealthHandle;
use order_common::dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterSink};
use order_common::event::OrderEvent;
use order_common::queue::Delivery;
use order_common::retry::RetryPolicy;
use order_common::schema::TableName;
use order_common::warehouse::{SinkError, WarehouseSink, WriteMode};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{PipelineError, WriteError};

/// How often the batching task reports liveness while idle.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub table: TableName,
    pub mode: WriteMode,
    pub max_batch_size: usize,
    pub max_batch_size_bytes: usize,
    pub max_batch_age: Duration,
    /// Write attempts per batch, the first one included
    pub max_attempts: u32,
    pub write_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub channel_capacity: usize,
    /// How long the sink may keep failing before the process gives up
    pub sink_grace_period: Duration,
}

impl WriterConfig {
    /// Longest the batching task can go without reporting: a full retry
    /// cycle of the flush it waits on, plus slack.
    pub fn liveness_deadline(&self) -> Duration {
        let worst_flush: Duration = (0..self.max_attempts)
            .map(|attempt| {
                self.write_timeout + self.retry_policy.time_until_next_retry(attempt, None)
            })
            .sum();
        worst_flush + LIVENESS_INTERVAL * 2
    }
}

/// A parsed event waiting for its batch to be written, together with the
/// message it came from. The writer settles the delivery.
#[derive(Debug)]
pub struct PendingEvent {
    pub event: OrderEvent,
    pub payload: Bytes,
    pub delivery: Delivery,
}

impl PendingEvent {
    /// Batch size accounting uses the raw message size.
    fn size(&self) -> usize {
        self.payload.len()
    }
}

type FlushResponder = oneshot::Sender<Result<usize, WriteError>>;

enum Command {
    Submit(PendingEvent),
    Flush(FlushResponder),
}

struct SealedBatch {
    events: Vec<PendingEvent>,
    responder: Option<FlushResponder>,
}

/// Cloneable submission side of the writer, one per worker.
#[derive(Clone)]
pub struct WriterHandle {
    sender: mpsc::Sender<Command>,
}

impl WriterHandle {
    /// Buffer an event. Waits while the writer's channel is full, which is
    /// how workers feel backpressure. If the writer is gone the message is
    /// nacked so the broker redelivers it.
    pub async fn submit(&self, pending: PendingEvent) -> Result<(), WriteError> {
        match self.sender.send(Command::Submit(pending)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(command)) => {
                if let Command::Submit(pending) = command {
                    if let Err(e) = pending.delivery.nack() {
                        error!("failed to nack message after writer closed: {}", e);
                    }
                }
                Err(WriteError::WriterClosed)
            }
        }
    }

    /// Seal the open batch, if any, and wait until it and every batch before
    /// it have been written or dead-lettered. Returns the rows written for
    /// the open batch.
    pub async fn flush(&self) -> Result<usize, WriteError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Flush(tx))
            .await
            .map_err(|_| WriteError::WriterClosed)?;
        rx.await.map_err(|_| WriteError::WriterClosed)?
    }
}

pub struct Writer {
    handle: WriterHandle,
    closing: CancellationToken,
    batcher: JoinHandle<()>,
    flusher: JoinHandle<()>,
}

impl Writer {
    /// Spawn the batching and flush tasks. `fatal` is cancelled when the sink
    /// keeps failing for longer than the sink grace period.
    pub fn start(
        sink: Arc<dyn WarehouseSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: WriterConfig,
        liveness: HealthHandle,
        fatal: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let (flush_sender, flush_receiver) = mpsc::channel(1);
        let closing = CancellationToken::new();

        let flusher = Flusher {
            sink,
            dead_letters: dead_letters.clone(),
            config: config.clone(),
            fatal,
            failing_since: None,
        };
        let flusher = tokio::spawn(flusher.run(flush_receiver));

        let batcher = Batcher {
            config,
            dead_letters,
            open: Vec::new(),
            open_bytes: 0,
            opened_at: None,
            flush_sender,
        };
        let batcher = tokio::spawn(batcher.run(receiver, liveness, closing.clone()));

        Self {
            handle: WriterHandle { sender },
            closing,
            batcher,
            flusher,
        }
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Stop accepting events, force-flush the open batch even under
    /// threshold, and wait until every buffered message is settled.
    pub async fn close(self) -> Result<(), PipelineError> {
        let Writer {
            handle,
            closing,
            batcher,
            flusher,
        } = self;

        closing.cancel();
        drop(handle);

        batcher.await?;
        flusher.await?;
        info!("writer closed");
        Ok(())
    }
}

struct Batcher {
    config: WriterConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
    open: Vec<PendingEvent>,
    open_bytes: usize,
    opened_at: Option<Instant>,
    flush_sender: mpsc::Sender<SealedBatch>,
}

impl Batcher {
    async fn run(
        mut self,
        mut receiver: mpsc::Receiver<Command>,
        liveness: HealthHandle,
        closing: CancellationToken,
    ) {
        let mut liveness_tick = tokio::time::interval(LIVENESS_INTERVAL);

        loop {
            let deadline = self
                .opened_at
                .map(|opened_at| opened_at + self.config.max_batch_age);

            tokio::select! {
                _ = closing.cancelled() => break,
                command = receiver.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sleep_until(deadline) => self.seal("age", None).await,
                _ = liveness_tick.tick() => liveness.report_healthy().await,
            }
        }

        // Whatever workers already handed over still belongs in the last batch
        receiver.close();
        while let Some(command) = receiver.recv().await {
            self.handle(command).await;
        }
        self.seal("shutdown", None).await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(pending) => self.add(pending).await,
            Command::Flush(responder) => self.seal("explicit", Some(responder)).await,
        }
    }

    async fn add(&mut self, pending: PendingEvent) {
        let size = pending.size();
        let limit = self.config.max_batch_size_bytes;

        if size > limit {
            let error = WriteError::EventTooLarge { size, limit };
            warn!(order_id = %pending.event.key(), size, "{}", error);
            dead_letter(
                self.dead_letters.as_ref(),
                vec![pending],
                DeadLetterReason::EventTooLarge,
                &error.to_string(),
            )
            .await;
            return;
        }

        // Never let a batch grow past the byte limit
        if !self.open.is_empty() && self.open_bytes + size > limit {
            self.seal("bytes", None).await;
        }

        if self.open.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.open_bytes += size;
        self.open.push(pending);

        if self.open.len() >= self.config.max_batch_size {
            self.seal("count", None).await;
        } else if self.open_bytes >= limit {
            self.seal("bytes", None).await;
        }
    }

    /// Hand the open batch to the flush task. Waits while a sealed batch is
    /// already queued behind the in-flight flush.
    async fn seal(&mut self, trigger: &'static str, responder: Option<FlushResponder>) {
        if self.open.is_empty() && responder.is_none() {
            return;
        }

        let events = std::mem::take(&mut self.open);
        debug!(
            trigger,
            batch_size = events.len(),
            batch_bytes = self.open_bytes,
            "sealed batch"
        );
        self.open_bytes = 0;
        self.opened_at = None;
        metrics::counter!("order_pipeline_batches_sealed_total", "trigger" => trigger)
            .increment(1);

        if let Err(mpsc::error::SendError(batch)) = self
            .flush_sender
            .send(SealedBatch { events, responder })
            .await
        {
            error!(
                "flush task is gone, nacking {} messages",
                batch.events.len()
            );
            nack_all(batch.events);
            if let Some(responder) = batch.responder {
                if responder.send(Err(WriteError::WriterClosed)).is_err() {
                    debug!("flush requester went away before the writer closed");
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Flusher {
    sink: Arc<dyn WarehouseSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: WriterConfig,
    fatal: CancellationToken,
    failing_since: Option<Instant>,
}

impl Flusher {
    async fn run(mut self, mut receiver: mpsc::Receiver<SealedBatch>) {
        while let Some(SealedBatch { events, responder }) = receiver.recv().await {
            let result = if events.is_empty() {
                Ok(0)
            } else {
                let span = info_span!("flush", batch_size = events.len());
                self.flush(events).instrument(span).await
            };

            if let Some(responder) = responder {
                if responder.send(result).is_err() {
                    debug!("flush requester went away before the result");
                }
            }
        }
    }

    /// Write one sealed batch and settle all of its messages.
    async fn flush(&mut self, events: Vec<PendingEvent>) -> Result<usize, WriteError> {
        let rows = match self.config.mode {
            WriteMode::IdempotentUpsertByKey => dedup_by_key(&events),
            WriteMode::AppendOnly => events.iter().map(|p| p.event.clone()).collect(),
        };
        metrics::histogram!("order_pipeline_batch_size").record(events.len() as f64);

        let started = Instant::now();
        let mut attempt = 0;

        let error = loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.write_timeout,
                self.sink.append(&self.config.table, &rows, self.config.mode),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SinkError::Transient(format!(
                    "write timed out after {:?}",
                    self.config.write_timeout
                ))),
            };

            match result {
                Ok(written) => {
                    metrics::counter!("order_pipeline_flush_attempts_total", "outcome" => "success")
                        .increment(1);
                    metrics::histogram!("order_pipeline_flush_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    metrics::counter!("order_pipeline_events_written_total")
                        .increment(rows.len() as u64);
                    self.failing_since = None;

                    info!(
                        written,
                        duplicates = events.len() - rows.len(),
                        attempt,
                        "flushed batch"
                    );
                    ack_all(events);
                    return Ok(written);
                }
                Err(error) if !error.is_retryable() => {
                    metrics::counter!("order_pipeline_flush_attempts_total", "outcome" => "permanent")
                        .increment(1);
                    self.failing_since = None;
                    break WriteError::Permanent(error);
                }
                Err(error) => {
                    metrics::counter!("order_pipeline_flush_attempts_total", "outcome" => "transient")
                        .increment(1);
                    self.check_grace_period();

                    if attempt >= self.config.max_attempts {
                        break WriteError::Transient { attempts: attempt, error };
                    }

                    let backoff = self
                        .config
                        .retry_policy
                        .time_until_next_retry(attempt - 1, None);
                    warn!(attempt, ?backoff, "sink write failed, retrying: {}", error);
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        metrics::histogram!("order_pipeline_flush_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        error!(batch_size = events.len(), "dead-lettering batch: {}", error);

        let reason = match error {
            WriteError::Permanent(_) => DeadLetterReason::SinkPermanentFailure,
            _ => DeadLetterReason::SinkTransientFailure,
        };
        dead_letter(
            self.dead_letters.as_ref(),
            events,
            reason,
            &error.to_string(),
        )
        .await;

        Err(error)
    }

    fn check_grace_period(&mut self) {
        let since = *self.failing_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.config.sink_grace_period && !self.fatal.is_cancelled() {
            error!(
                "sink has been failing for {:?}, longer than the grace period",
                since.elapsed()
            );
            self.fatal.cancel();
        }
    }
}

/// Collapse events sharing an `order_id`: the last one wins, at the position
/// of the first.
fn dedup_by_key(events: &[PendingEvent]) -> Vec<OrderEvent> {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(events.len());
    let mut rows: Vec<OrderEvent> = Vec::with_capacity(events.len());

    for pending in events {
        match positions.get(pending.event.key()) {
            Some(&position) => rows[position] = pending.event.clone(),
            None => {
                positions.insert(pending.event.key(), rows.len());
                rows.push(pending.event.clone());
            }
        }
    }

    rows
}

/// Record every event as a dead letter, then ack them all. If the dead letters
/// cannot be recorded the messages are nacked instead, so none is lost.
async fn dead_letter(
    dead_letters: &dyn DeadLetterSink,
    events: Vec<PendingEvent>,
    reason: DeadLetterReason,
    detail: &str,
) {
    let records = events
        .iter()
        .map(|pending| {
            DeadLetterRecord::write_failed(
                pending.payload.clone(),
                pending.event.key(),
                reason,
                detail.to_owned(),
            )
        })
        .collect();

    match dead_letters.record(records).await {
        Ok(()) => {
            metrics::counter!("order_pipeline_dead_letter_total", "reason" => reason.as_str())
                .increment(events.len() as u64);
            ack_all(events);
        }
        Err(e) => {
            error!(
                reason = reason.as_str(),
                "failed to record {} dead letters, nacking: {}",
                events.len(),
                e
            );
            nack_all(events);
        }
    }
}

fn ack_all(events: Vec<PendingEvent>) {
    for pending in events {
        if let Err(e) = pending.delivery.ack() {
            error!("failed to ack message: {}", e);
        }
    }
}

fn nack_all(events: Vec<PendingEvent>) {
    for pending in events {
        if let Err(e) = pending.delivery.nack() {
            error!("failed to nack message: {}", e);
        }
    }
}

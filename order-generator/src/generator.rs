use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use order_common::event::OrderEvent;
use order_common::queue::{Publisher, QueueError};
use order_common::retry::RetryPolicy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Builder;

/// A random but well-formed order. Identifiers come from `rng`, so a seeded
/// generator yields a reproducible sequence apart from `event_time`.
pub fn random_order<R: Rng + ?Sized>(rng: &mut R) -> OrderEvent {
    OrderEvent {
        order_id: Builder::from_random_bytes(rng.gen()).into_uuid().to_string(),
        user_id: format!("U{}", rng.gen_range(100..=999)),
        product_id: format!("P{}", rng.gen_range(1..=50)),
        amount: f64::from(rng.gen_range(1..=999_u32)) / 10.0,
        event_time: Utc::now(),
    }
}

/// Endless, lazily generated orders. Every call starts a new sequence.
pub fn orders() -> impl Iterator<Item = OrderEvent> + Send {
    orders_from(StdRng::from_entropy())
}

pub fn orders_from<R: Rng + Send>(mut rng: R) -> impl Iterator<Item = OrderEvent> + Send {
    std::iter::repeat_with(move || random_order(&mut rng))
}

#[derive(Clone, Debug)]
pub struct GeneratorSettings {
    pub topic: String,
    /// Time between two orders, the inverse of the configured rate
    pub interval: Duration,
    /// None publishes until shutdown
    pub duration: Option<Duration>,
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub published: u64,
    pub failed: u64,
}

/// Publish orders at a steady rate until the run duration is over or
/// `shutdown` is cancelled. A failed publish is logged and counted; it never
/// stops the loop.
pub async fn generate(
    publisher: &dyn Publisher,
    mut orders: impl Iterator<Item = OrderEvent>,
    settings: &GeneratorSettings,
    shutdown: CancellationToken,
) -> Summary {
    let mut summary = Summary::default();
    let mut ticker = tokio::time::interval(settings.interval.max(Duration::from_nanos(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = settings.duration.map(|d| Instant::now() + d);

    info!(
        topic = %settings.topic,
        interval_ms = settings.interval.as_millis() as u64,
        "generating orders"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = run_out(deadline) => break,
            _ = ticker.tick() => {}
        }
        // generated on the tick, so event_time is the publish instant
        let Some(order) = orders.next() else { break };

        match publish_with_retry(publisher, &order, settings, &shutdown).await {
            Ok(()) => {
                summary.published += 1;
                metrics::counter!("order_generator_published_total").increment(1);
                info!(
                    order_id = %order.order_id,
                    user_id = %order.user_id,
                    product_id = %order.product_id,
                    amount = order.amount,
                    event_time = %order.event_time.to_rfc3339(),
                    "published order"
                );
            }
            Err(e) => {
                summary.failed += 1;
                metrics::counter!("order_generator_publish_failures_total").increment(1);
                error!(order_id = %order.order_id, "failed to publish order: {}", e);
            }
        }
    }

    info!(
        published = summary.published,
        failed = summary.failed,
        "stopped generating orders"
    );
    summary
}

async fn run_out(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn publish_with_retry(
    publisher: &dyn Publisher,
    order: &OrderEvent,
    settings: &GeneratorSettings,
    shutdown: &CancellationToken,
) -> Result<(), QueueError> {
    let payload = order
        .to_json()
        .map(Bytes::from)
        .map_err(|e| QueueError::PublishFailed(e.to_string()))?;

    let mut attempt = 1;
    loop {
        match publisher
            .publish(&settings.topic, Some(order.key()), payload.clone())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= settings.max_attempts || shutdown.is_cancelled() => {
                return Err(e)
            }
            Err(e) => {
                let backoff = settings.retry_policy.time_until_next_retry(attempt - 1, None);
                warn!(
                    order_id = %order.order_id,
                    attempt,
                    "publish failed, retrying in {:?}: {}",
                    backoff,
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(e),
                    _ = tokio::time::sleep(backoff) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use order_common::parse::parse;
    use order_common::queue::memory::MemoryQueue;

    use super::*;

    const TOPIC: &str = "orders";

    fn settings(interval: Duration, duration: Option<Duration>) -> GeneratorSettings {
        GeneratorSettings {
            topic: TOPIC.to_owned(),
            interval,
            duration,
            max_attempts: 3,
            retry_policy: RetryPolicy::new(2, Duration::from_millis(1), None),
        }
    }

    /// Fails the first `failures` publishes, then behaves like a queue.
    struct Flaky {
        failures: AtomicU32,
        queue: MemoryQueue,
    }

    #[async_trait]
    impl Publisher for Flaky {
        async fn publish(
            &self,
            topic: &str,
            key: Option<&str>,
            payload: Bytes,
        ) -> Result<(), QueueError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(QueueError::PublishFailed("broker down".to_owned()));
            }
            self.queue.publish(topic, key, payload).await
        }
    }

    /// Records how old each order's event_time was when it was published.
    #[derive(Default)]
    struct AgeAtPublish {
        ages: std::sync::Mutex<Vec<chrono::Duration>>,
    }

    #[async_trait]
    impl Publisher for AgeAtPublish {
        async fn publish(
            &self,
            _topic: &str,
            _key: Option<&str>,
            payload: Bytes,
        ) -> Result<(), QueueError> {
            let order = parse(&payload).expect("generated order rejected");
            self.ages.lock().unwrap().push(Utc::now() - order.event_time);
            Ok(())
        }
    }

    #[test]
    fn test_orders_are_within_range() {
        let mut order_ids = HashSet::new();

        for order in orders_from(StdRng::seed_from_u64(7)).take(1000) {
            let user: u32 = order.user_id.strip_prefix('U').unwrap().parse().unwrap();
            let product: u32 = order.product_id.strip_prefix('P').unwrap().parse().unwrap();
            let tenths = (order.amount * 10.0).round();

            assert!((100..=999).contains(&user), "{}", order.user_id);
            assert!((1..=50).contains(&product), "{}", order.product_id);
            assert!((order.amount * 10.0 - tenths).abs() < 1e-9, "{}", order.amount);
            assert!((1.0..=999.0).contains(&tenths), "{}", order.amount);
            assert_eq!(order.order_id.len(), 36);
            order_ids.insert(order.order_id);
        }

        assert_eq!(order_ids.len(), 1000);
    }

    #[test]
    fn test_seeded_sequences_repeat() {
        let first: Vec<String> = orders_from(StdRng::seed_from_u64(1))
            .take(5)
            .map(|o| o.order_id)
            .collect();
        let second: Vec<String> = orders_from(StdRng::seed_from_u64(1))
            .take(5)
            .map(|o| o.order_id)
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_generated_orders_pass_the_parser() {
        for order in orders().take(100) {
            let parsed = parse(&order.to_json().unwrap()).expect("generated order rejected");
            assert_eq!(parsed, order);
        }
    }

    #[tokio::test]
    async fn test_stops_after_run_duration() {
        let queue = MemoryQueue::new();

        let summary = generate(
            &queue,
            orders(),
            &settings(Duration::from_millis(10), Some(Duration::from_millis(100))),
            CancellationToken::new(),
        )
        .await;

        assert!(summary.published > 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(queue.pending(TOPIC) as u64, summary.published);
    }

    #[tokio::test]
    async fn test_event_time_is_the_publish_instant() {
        let publisher = AgeAtPublish::default();

        generate(
            &publisher,
            orders().take(3),
            &settings(Duration::from_millis(200), None),
            CancellationToken::new(),
        )
        .await;

        let ages = publisher.ages.lock().unwrap();
        assert_eq!(ages.len(), 3);
        for age in ages.iter() {
            assert!(*age < chrono::Duration::milliseconds(100), "{age}");
        }
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let queue = MemoryQueue::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let summary = generate(
            &queue,
            orders(),
            &settings(Duration::from_millis(10), None),
            shutdown,
        )
        .await;

        assert_eq!(summary, Summary::default());
    }

    #[tokio::test]
    async fn test_transient_publish_failures_are_retried() {
        let flaky = Flaky {
            failures: AtomicU32::new(2),
            queue: MemoryQueue::new(),
        };

        let summary = generate(
            &flaky,
            orders().take(3),
            &settings(Duration::from_millis(1), None),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            summary,
            Summary {
                published: 3,
                failed: 0
            }
        );
        assert_eq!(flaky.queue.pending(TOPIC), 3);
    }

    #[tokio::test]
    async fn test_publish_failures_are_not_fatal() {
        let queue = MemoryQueue::new();
        queue.set_unavailable(TOPIC, true);

        let summary = generate(
            &queue,
            orders().take(4),
            &settings(Duration::from_millis(1), None),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            summary,
            Summary {
                published: 0,
                failed: 4
            }
        );
    }
}

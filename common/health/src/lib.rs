//! Liveness reporting for the long-running loops of the order services.
//!
//! Every loop that has to keep making progress (consumption workers, the
//! batching writer, the Kafka client threads) registers a component with a
//! reporting deadline. The registry is healthy only while each component has
//! reported healthy within its deadline and none has declared itself
//! unhealthy. `/_liveness` serves [`HealthRegistry::get_status`] directly.
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reports queued before the registry task applies them.
const REPORT_BUFFER: usize = 64;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no report yet
    Starting,
    HealthyUntil(OffsetDateTime),
    /// Declared by the component itself, with the reason it gave
    Unhealthy(String),
    /// Healthy once, but the deadline passed without a new report
    Stalled,
}

impl ComponentStatus {
    /// The status as seen at `now`: an expired `HealthyUntil` is `Stalled`.
    fn at(&self, now: OffsetDateTime) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
            other => other.clone(),
        }
    }
}

/// Snapshot of every registered component.
#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl HealthStatus {
    /// One line per component, sorted by name, for humans reading the probe.
    fn render(&self) -> String {
        let mut body = String::from(if self.healthy { "ok\n" } else { "failing\n" });
        for (name, status) in &self.components {
            let line = match status {
                ComponentStatus::Starting => format!("{name}: starting\n"),
                ComponentStatus::HealthyUntil(until) => format!("{name}: healthy until {until}\n"),
                ComponentStatus::Unhealthy(reason) => format!("{name}: unhealthy, {reason}\n"),
                ComponentStatus::Stalled => format!("{name}: stalled\n"),
            };
            body.push_str(&line);
        }
        body
    }
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, self.render()).into_response()
    }
}

struct Report {
    component: String,
    status: ComponentStatus,
}

/// Handed to one component; cloning it reports under the same name.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    reports: mpsc::Sender<Report>,
}

impl HealthHandle {
    /// Healthy until `now + deadline`. The component must report again before then.
    pub async fn report_healthy(&self) {
        self.report_status(self.healthy_until()).await
    }

    pub async fn report_unhealthy(&self, reason: impl Into<String>) {
        self.report_status(ComponentStatus::Unhealthy(reason.into()))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let report = Report {
            component: self.component.clone(),
            status,
        };
        if let Err(e) = self.reports.send(report).await {
            warn!(component = %self.component, "failed to report health: {}", e);
        }
    }

    /// For callers outside async code, like the librdkafka statistics callback.
    pub fn report_healthy_blocking(&self) {
        let status = self.healthy_until();

        // blocking_send panics on a runtime thread
        match runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = self.clone();
                runtime.spawn(async move { handle.report_status(status).await });
            }
            Err(_) => {
                let report = Report {
                    component: self.component.clone(),
                    status,
                };
                if let Err(e) = self.reports.blocking_send(report) {
                    warn!(component = %self.component, "failed to report health: {}", e);
                }
            }
        }
    }

    fn healthy_until(&self) -> ComponentStatus {
        ComponentStatus::HealthyUntil(OffsetDateTime::now_utc() + self.deadline)
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<BTreeMap<String, ComponentStatus>>>,
    reports: mpsc::Sender<Report>,
}

impl HealthRegistry {
    /// Spawns the task applying reports, so it needs a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (reports, mut received) = mpsc::channel::<Report>(REPORT_BUFFER);
        let components: Arc<RwLock<BTreeMap<String, ComponentStatus>>> = Default::default();

        let applied = components.clone();
        tokio::spawn(async move {
            while let Some(report) = received.recv().await {
                match applied.write() {
                    Ok(mut components) => {
                        components.insert(report.component, report.status);
                    }
                    // the probe fails from now on and the process gets restarted
                    Err(_) => warn!("health registry lock poisoned, dropping report"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            reports,
        }
    }

    /// Add a component in `Starting`. The registry stays unhealthy until it reports.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            reports: self.reports.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    pub fn get_status(&self) -> HealthStatus {
        let Ok(registered) = self.components.read() else {
            warn!("health registry lock poisoned");
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let components: BTreeMap<String, ComponentStatus> = registered
            .iter()
            .map(|(name, status)| (name.clone(), status.at(now)))
            .collect();
        // nothing registered yet is not a healthy process
        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));

        if healthy {
            debug!("{} check ok", self.name);
        } else {
            warn!("{} check failed: {:?}", self.name, components);
        }
        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use time::OffsetDateTime;

    use super::*;

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn worker_goes_from_starting_to_healthy_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");

        let worker = registry
            .register("worker-0".to_string(), Duration::from_secs(30))
            .await;
        eventually(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker-0"),
            Some(&ComponentStatus::Starting)
        );

        worker.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        worker.report_unhealthy("queue unreachable").await;
        eventually(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("worker-0"),
            Some(&ComponentStatus::Unhealthy("queue unreachable".to_owned()))
        );
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let writer = registry
            .register("writer".to_string(), Duration::from_secs(30))
            .await;

        writer.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        writer
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc() - Duration::from_secs(1),
            ))
            .await;
        eventually(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("writer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn every_worker_must_report() {
        let registry = HealthRegistry::new("liveness");
        let first = registry
            .register("worker-0".to_string(), Duration::from_secs(30))
            .await;
        let second = registry
            .register("worker-1".to_string(), Duration::from_secs(30))
            .await;
        eventually(|| registry.get_status().components.len() == 2).await;

        first.report_healthy().await;
        eventually(|| {
            registry.get_status().components.get("worker-0") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        second.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;
    }

    #[test]
    fn blocking_report_outside_the_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let registry = runtime.block_on(async { HealthRegistry::new("liveness") });
        let rdkafka = runtime.block_on(registry.register("rdkafka".to_string(), Duration::from_secs(30)));

        rdkafka.report_healthy_blocking();

        runtime.block_on(eventually(|| registry.get_status().healthy));
    }

    #[tokio::test]
    async fn probe_body_lists_components() {
        let status = HealthStatus {
            healthy: false,
            components: BTreeMap::from([
                ("worker-0".to_owned(), ComponentStatus::Stalled),
                (
                    "writer".to_owned(),
                    ComponentStatus::Unhealthy("sink down".to_owned()),
                ),
            ]),
        };
        assert_eq!(status.render(), "failing\nworker-0: stalled\nwriter: unhealthy, sink down\n");
        assert_eq!(
            status.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        };
        assert_eq!(ok.into_response().status(), StatusCode::OK);
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{SinkError, WarehouseSink, WriteMode};
use crate::event::OrderEvent;
use crate::schema::TableName;

/// A warehouse kept in process memory, for local runs and tests.
///
/// Upserts replace rows in place, so row order is the order in which keys
/// were first written. Failures and latency can be injected to exercise the
/// writer's retry paths.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    failures: VecDeque<SinkError>,
    latency: Duration,
    appends: Vec<usize>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Default)]
struct Table {
    rows: Vec<OrderEvent>,
    index: HashMap<String, usize>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Make the next `count` appends fail with `error`, before any row is written.
    pub fn fail_next(&self, count: usize, error: SinkError) {
        self.with_state(|state| {
            state
                .failures
                .extend(std::iter::repeat(error).take(count))
        });
    }

    /// Delay every append, to simulate a slow backend.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|state| state.latency = latency);
    }

    pub fn rows(&self, table: &str) -> Vec<OrderEvent> {
        self.with_state(|state| {
            state
                .tables
                .get(table)
                .map(|t| t.rows.clone())
                .unwrap_or_default()
        })
    }

    /// Row count of every successful append, in call order.
    pub fn appends(&self) -> Vec<usize> {
        self.with_state(|state| state.appends.clone())
    }

    /// Highest number of appends that were ever running at the same time.
    pub fn max_concurrent_appends(&self) -> usize {
        self.with_state(|state| state.max_in_flight)
    }
}

/// Counts one running append, released even when the caller times out.
struct InFlight<'a>(&'a MemoryWarehouse);

impl<'a> InFlight<'a> {
    fn enter(warehouse: &'a MemoryWarehouse) -> Self {
        warehouse.with_state(|state| {
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        });
        Self(warehouse)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.with_state(|state| state.in_flight -= 1);
    }
}

#[async_trait]
impl WarehouseSink for MemoryWarehouse {
    async fn append(
        &self,
        table: &TableName,
        rows: &[OrderEvent],
        mode: WriteMode,
    ) -> Result<usize, SinkError> {
        let _running = InFlight::enter(self);
        let latency = self.with_state(|state| state.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.with_state(|state| {
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }

            let target = state.tables.entry(table.to_string()).or_default();
            for row in rows {
                match (mode, target.index.get(&row.order_id)) {
                    (WriteMode::IdempotentUpsertByKey, Some(&position)) => {
                        target.rows[position] = row.clone();
                    }
                    _ => {
                        target.index.insert(row.order_id.clone(), target.rows.len());
                        target.rows.push(row.clone());
                    }
                }
            }
            state.appends.push(rows.len());
            Ok(rows.len())
        })
    }
}

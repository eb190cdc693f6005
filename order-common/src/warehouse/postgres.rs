use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

use super::{SinkError, WarehouseSink, WriteMode};
use crate::event::OrderEvent;
use crate::schema::TableName;

const COLUMNS: usize = 5;
// Postgres caps a statement at 65535 bind parameters
const ROWS_PER_STATEMENT: usize = 65535 / COLUMNS;

/// Writes order rows to a Postgres table through a connection pool.
///
/// The table is expected to exist with a unique constraint on `order_id`,
/// which the upsert relies on.
#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(classify)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WarehouseSink for PgWarehouse {
    async fn append(
        &self,
        table: &TableName,
        rows: &[OrderEvent],
        mode: WriteMode,
    ) -> Result<usize, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;
        let mut written = 0;

        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} (order_id, user_id, product_id, amount, event_time) "
            ));
            query.push_values(chunk, |mut row, event| {
                row.push_bind(event.order_id.as_str())
                    .push_bind(event.user_id.as_str())
                    .push_bind(event.product_id.as_str())
                    .push_bind(event.amount)
                    .push_bind(event.event_time);
            });
            if mode == WriteMode::IdempotentUpsertByKey {
                query.push(
                    " ON CONFLICT (order_id) DO UPDATE SET \
                     user_id = EXCLUDED.user_id, \
                     product_id = EXCLUDED.product_id, \
                     amount = EXCLUDED.amount, \
                     event_time = EXCLUDED.event_time",
                );
            }

            let result = query.build().execute(&mut *tx).await.map_err(classify)?;
            written += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(classify)?;
        debug!(table = %table, rows = written, "wrote rows to postgres");

        Ok(written)
    }
}

/// Errors caused by the statement or the data are permanent: SQLSTATE class
/// 22 (data exception), 23 (integrity violation) and 42 (syntax error or
/// undefined object). Anything else may succeed on another attempt.
fn classify(error: sqlx::Error) -> SinkError {
    match &error {
        sqlx::Error::Database(db_error) => match db_error.code() {
            Some(code) if ["22", "23", "42"].iter().any(|class| code.starts_with(class)) => {
                SinkError::Permanent(error.to_string())
            }
            _ => SinkError::Transient(error.to_string()),
        },
        sqlx::Error::Configuration(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. } => SinkError::Permanent(error.to_string()),
        _ => SinkError::Transient(error.to_string()),
    }
}

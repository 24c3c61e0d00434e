use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_ATTEMPTS: i32 = 8;
const DRAIN_INTERVAL: Duration = Duration::from_millis(500);
const BATCH_SIZE: i64 = 50;

/// Enqueues a workflow event into the outbox table, inside the caller's
/// transaction. The event is only delivered if that transaction commits,
/// which keeps notification emission from ever influencing transactional
/// outcome.
///
/// Only the Postgres backend carries an outbox; on other backends the
/// post-commit `EventSender::emit` path is the delivery mechanism and this
/// call is a no-op.
pub async fn enqueue(
    db: &impl ConnectionTrait,
    aggregate_type: &str,
    aggregate_id: Uuid,
    event: &Event,
) -> Result<(), ServiceError> {
    if db.get_database_backend() != DbBackend::Postgres {
        debug!(
            aggregate_type,
            event = event.name(),
            "outbox enqueue skipped for non-Postgres backend"
        );
        return Ok(());
    }

    let payload =
        serde_json::to_value(event).map_err(|e| ServiceError::EventError(e.to_string()))?;

    let sql = r#"INSERT INTO outbox_events
        (id, aggregate_type, aggregate_id, event_type, payload, status, attempts, created_at)
        VALUES ($1, $2, $3, $4, $5::jsonb, 'pending', 0, NOW())"#;
    let stmt = Statement::from_sql_and_values(
        DbBackend::Postgres,
        sql,
        vec![
            Uuid::new_v4().into(),
            aggregate_type.into(),
            aggregate_id.into(),
            event.name().into(),
            payload.into(),
        ],
    );
    db.execute(stmt).await.map_err(ServiceError::db_error)?;
    Ok(())
}

/// Spawns the background worker that drains pending outbox rows into the
/// in-process event channel. Disabled for non-Postgres backends.
pub fn start_worker(db: Arc<DatabaseConnection>, sender: EventSender) {
    if db.get_database_backend() != DbBackend::Postgres {
        info!(
            "Outbox worker disabled for {:?} backend; relying on direct event emission",
            db.get_database_backend()
        );
        return;
    }

    tokio::spawn(async move {
        loop {
            if let Err(e) = drain_once(&db, &sender, BATCH_SIZE).await {
                error!("outbox worker error: {}", e);
            }
            sleep(DRAIN_INTERVAL).await;
        }
    });
}

async fn drain_once(
    db: &DatabaseConnection,
    sender: &EventSender,
    batch_size: i64,
) -> Result<(), ServiceError> {
    // SKIP LOCKED keeps concurrent workers from fighting over rows.
    let sql_claim = r#"
        UPDATE outbox_events SET status = 'processing'
        WHERE id IN (
            SELECT id FROM outbox_events
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, payload, attempts"#;
    let rows = db
        .query_all(Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql_claim,
            vec![batch_size.into()],
        ))
        .await
        .map_err(ServiceError::db_error)?;

    for row in rows {
        let id: Uuid = row.try_get("", "id").map_err(ServiceError::db_error)?;
        let payload: serde_json::Value =
            row.try_get("", "payload").map_err(ServiceError::db_error)?;
        let attempts: i32 = row.try_get("", "attempts").map_err(ServiceError::db_error)?;

        let delivered = match serde_json::from_value::<Event>(payload) {
            Ok(event) => sender.send(event).await.is_ok(),
            Err(e) => {
                warn!(outbox_id = %id, error = %e, "undeliverable outbox payload");
                false
            }
        };

        let status = if delivered {
            "delivered"
        } else if attempts + 1 >= MAX_ATTEMPTS {
            "failed"
        } else {
            "pending"
        };

        db.execute(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE outbox_events SET status = $1, attempts = attempts + 1 WHERE id = $2",
            vec![status.into(), id.into()],
        ))
        .await
        .map_err(ServiceError::db_error)?;
    }

    Ok(())
}

//! Implementación Postgres (Diesel) de `CheckpointStore`.
//!
//! - Un checkpoint vigente por flow (`flow_checkpoints`, PK `flow_id`). Una
//!   escritura con `sequence` no mayor que la almacenada se ignora, igual que
//!   el backend en memoria.
//! - `finish` borra el checkpoint y registra el resultado en `flow_outcomes`
//!   dentro de la MISMA transacción.
//! - Errores transitorios (pool, serialización) se reintentan con backoff
//!   corto.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::{debug, info, warn};
use uuid::Uuid;

use flow_core::{CheckpointError, CheckpointStore, FlowId, FlowOutcome, FlowStatus, SerializedCheckpoint};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{flow_checkpoints, flow_outcomes};

/// Pool r2d2 de conexiones Postgres. Al construirlo con `build_pool` se
/// corren las migraciones pendientes.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub type PgPooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Contrato: devuelve una conexión válida o `PersistenceError::TransientIo`.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError>;
}

/// `ConnectionProvider` respaldado por un `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = flow_checkpoints)]
pub struct NewCheckpointRow<'a> {
    pub flow_id: Uuid,
    pub sequence: i64,
    pub fingerprint: &'a str,
    pub payload: &'a [u8],
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Debug)]
pub struct CheckpointRow {
    pub flow_id: Uuid,
    pub sequence: i64,
    pub fingerprint: String,
    pub payload: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for SerializedCheckpoint {
    fn from(row: CheckpointRow) -> Self {
        Self { flow_id: FlowId(row.flow_id),
               sequence: row.sequence.max(0) as u64,
               fingerprint: row.fingerprint,
               bytes: row.payload }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = flow_outcomes)]
pub struct NewOutcomeRow<'a> {
    pub flow_id: Uuid,
    pub status: &'a str,
    pub error: Option<&'a str>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Queryable, Debug)]
pub struct OutcomeRow {
    pub flow_id: Uuid,
    pub status: String,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

fn status_from_str(s: &str) -> Option<FlowStatus> {
    match s {
        "completed" => Some(FlowStatus::Completed),
        "failed" => Some(FlowStatus::Failed),
        _ => None,
    }
}

/// Reintento con backoff corto (hasta 3 reintentos: 15ms, 30ms, 45ms).
/// Solo repite la unidad de trabajo `f`; no altera su semántica.
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

/// Store de checkpoints sobre Postgres.
pub struct PgCheckpointStore<P: ConnectionProvider> {
    pub provider: P,
}

impl<P: ConnectionProvider> PgCheckpointStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Resultado terminal registrado por `finish`, si existe.
    pub fn outcome(&self, flow_id: FlowId) -> Result<Option<FlowOutcome>, PersistenceError> {
        let row: Option<OutcomeRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            flow_outcomes::table.find(flow_id.0)
                                .first(&mut conn)
                                .optional()
                                .map_err(PersistenceError::from)
        })?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status = status_from_str(&row.status).ok_or_else(|| {
                                                      PersistenceError::Unknown(format!("unknown outcome status '{}'",
                                                                                        row.status))
                                                  })?;
        Ok(Some(FlowOutcome { flow_id: FlowId(row.flow_id),
                              status,
                              error: row.error,
                              finished_at: row.finished_at }))
    }

    fn upsert(&self, checkpoint: &SerializedCheckpoint) -> Result<bool, PersistenceError> {
        let sequence = i64::try_from(checkpoint.sequence).map_err(|_| {
                                                             PersistenceError::Unknown(format!("sequence {} out of range",
                                                                                               checkpoint.sequence))
                                                         })?;
        let row = NewCheckpointRow { flow_id: checkpoint.flow_id.0,
                                     sequence,
                                     fingerprint: &checkpoint.fingerprint,
                                     payload: &checkpoint.bytes,
                                     updated_at: Utc::now() };
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| {
                    let current: Option<i64> = flow_checkpoints::table.find(row.flow_id)
                                                                      .select(flow_checkpoints::sequence)
                                                                      .for_update()
                                                                      .first(tx)
                                                                      .optional()?;
                    let written = match current {
                        Some(stored) if stored >= row.sequence => 0,
                        Some(_) => {
                            diesel::update(flow_checkpoints::table.find(row.flow_id))
                                .set((flow_checkpoints::sequence.eq(row.sequence),
                                      flow_checkpoints::fingerprint.eq(row.fingerprint),
                                      flow_checkpoints::payload.eq(row.payload),
                                      flow_checkpoints::updated_at.eq(row.updated_at)))
                                .execute(tx)?
                        }
                        None => diesel::insert_into(flow_checkpoints::table).values(&row)
                                                                            .on_conflict_do_nothing()
                                                                            .execute(tx)?,
                    };
                    Ok::<bool, diesel::result::Error>(written > 0)
                })
                .map_err(PersistenceError::from)
        })
    }
}

impl<P: ConnectionProvider> CheckpointStore for PgCheckpointStore<P> {
    fn save(&self, checkpoint: &SerializedCheckpoint) -> Result<(), CheckpointError> {
        let written = self.upsert(checkpoint)?;
        debug!("checkpoint:save flow_id={} sequence={} written={written}",
               checkpoint.flow_id, checkpoint.sequence);
        Ok(())
    }

    fn load(&self, flow_id: FlowId) -> Result<Option<SerializedCheckpoint>, CheckpointError> {
        let row: Option<CheckpointRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            flow_checkpoints::table.find(flow_id.0)
                                   .first(&mut conn)
                                   .optional()
                                   .map_err(PersistenceError::from)
        })?;
        Ok(row.map(SerializedCheckpoint::from))
    }

    fn delete(&self, flow_id: FlowId) -> Result<(), CheckpointError> {
        let n = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::delete(flow_checkpoints::table.find(flow_id.0)).execute(&mut conn)
                                                                   .map_err(PersistenceError::from)
        })?;
        debug!("checkpoint:delete flow_id={flow_id} rows={n}");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SerializedCheckpoint>, CheckpointError> {
        let rows: Vec<CheckpointRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            flow_checkpoints::table.order(flow_checkpoints::flow_id.asc())
                                   .load(&mut conn)
                                   .map_err(PersistenceError::from)
        })?;
        info!("checkpoint:load_all count={}", rows.len());
        Ok(rows.into_iter().map(SerializedCheckpoint::from).collect())
    }

    fn finish(&self, outcome: &FlowOutcome) -> Result<(), CheckpointError> {
        let row = NewOutcomeRow { flow_id: outcome.flow_id.0,
                                  status: outcome.status.as_str(),
                                  error: outcome.error.as_deref(),
                                  finished_at: outcome.finished_at };
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| {
                    diesel::delete(flow_checkpoints::table.find(row.flow_id)).execute(tx)?;
                    diesel::insert_into(flow_outcomes::table).values(&row)
                                                             .on_conflict_do_nothing()
                                                             .execute(tx)?;
                    Ok::<(), diesel::result::Error>(())
                })
                .map_err(PersistenceError::from)
        })?;
        debug!("checkpoint:finish flow_id={} status={}",
               outcome.flow_id,
               outcome.status.as_str());
        Ok(())
    }
}

/// Construye el pool y corre las migraciones pendientes.
///
/// Si `min_size > max_size` se usa `min_size = max_size`; un tamaño 0 se
/// trata como 1.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("pool: min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(validated_min.min(validated_max)))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Carga `.env`, lee `DbConfig` y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    crate::config::init_dotenv();
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_gives_up_after_three_retries() {
        let mut calls = 0;
        let r: Result<(), _> = with_retry(|| {
            calls += 1;
            Err(PersistenceError::SerializationConflict)
        });
        assert!(matches!(r, Err(PersistenceError::SerializationConflict)));
        assert_eq!(calls, 4);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let r: Result<(), _> = with_retry(|| {
            calls += 1;
            Err(PersistenceError::NotFound)
        });
        assert!(r.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn outcome_status_round_trips_through_text() {
        for status in [FlowStatus::Completed, FlowStatus::Failed] {
            assert_eq!(status_from_str(status.as_str()), Some(status));
        }
        assert_eq!(status_from_str("suspended"), None);
    }
}

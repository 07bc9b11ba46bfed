//! Constantes del orquestador.
//!
//! Algunos valores participan en el formato persistido de los checkpoints:
//! cambiar `CHECKPOINT_FORMAT_VERSION` invalida checkpoints escritos por
//! versiones anteriores.

/// Versión del formato de checkpoint. Se verifica al restaurar.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Identificador de aplicación por defecto anunciado en `SessionInit` /
/// `SessionConfirm`.
pub const DEFAULT_APP_NAME: &str = "flowmesh";

/// Capacidad por defecto de la caché de deduplicación.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Tamaño por defecto del pool de workers.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Resultados de flows terminados retenidos por defecto; al superarse se
/// descarta el más antiguo.
pub const DEFAULT_FINISHED_CAPACITY: usize = 1_000;

/// Segundos que una sesión huérfana espera su `SessionConfirm` antes de
/// descartarse.
pub const DEFAULT_ORPHAN_TIMEOUT_SECS: u64 = 300;

/// Reintentos de `CheckpointStore::finish` antes de dejar el flow aparcado.
pub const FINISH_RETRIES: u32 = 3;

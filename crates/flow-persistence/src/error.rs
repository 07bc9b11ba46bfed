//! Errores de persistencia.
//! Mapea errores de Diesel / pool a variantes semánticas y, hacia el core,
//! a `CheckpointError::Backend`.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use flow_core::CheckpointError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl PersistenceError {
    /// ¿Conviene reintentar la unidad de trabajo?
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SerializationConflict | Self::TransientIo(_) => true,
            // Algunos drivers reportan desconexiones solo como texto
            Self::Unknown(msg) => {
                let m = msg.to_lowercase();
                m.contains("deadlock detected")
                || m.contains("could not serialize access")
                || m.contains("connection closed")
                || m.contains("connection refused")
                || m.contains("timeout")
            }
            _ => false,
        }
    }
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection => Self::TransientIo(info.message().to_string()),
                other => Self::Unknown(format!("db error kind {other:?}: {}", info.message())),
            },
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            DieselError::RollbackErrorOnCommit { rollback_error,
                                                 commit_error, } => {
                Self::Unknown(format!("rollback={rollback_error}; commit={commit_error}"))
            }
            other => Self::Unknown(format!("diesel error: {other}")),
        }
    }
}

impl From<PersistenceError> for CheckpointError {
    fn from(err: PersistenceError) -> Self {
        CheckpointError::Backend(err.to_string())
    }
}

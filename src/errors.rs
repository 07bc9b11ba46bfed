use flow_core::FlowError;
use flow_persistence::PersistenceError;
use thiserror::Error;

/// Errores de la aplicación (demo y fachada).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Error de flow: {0}")]
    Flow(#[from] FlowError),
    #[error("Error de persistencia: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Error de configuración: {0}")]
    Config(String),
}

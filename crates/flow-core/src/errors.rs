//! Errores del orquestador.
//!
//! `FlowError` es la unión etiquetada que ven los routines y quienes esperan
//! el resultado de un flow. Solo `Application` cruza la frontera de
//! confianza (sin traza); el resto se reduce a un `ErrorSessionEnd` sin
//! payload en el lado remoto.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{FlowId, Party, SessionId};

/// Error de aplicación declarado: serializable y capturable por routines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationError {
    /// Tipo lógico del error (p.ej. `"InsufficientFunds"`).
    pub kind: String,
    pub message: String,
    /// Pila de frames local. Se vacía antes de enviarse por el cable.
    #[serde(default)]
    pub trace: Vec<String>,
    /// Sesión por la que se recibió (None si se originó localmente).
    #[serde(skip)]
    pub origin: Option<SessionId>,
}

impl ApplicationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(),
               message: message.into(),
               trace: Vec::new(),
               origin: None }
    }

    /// Copia apta para el cable: sin traza ni origen.
    pub fn stripped(&self) -> Self {
        Self { kind: self.kind.clone(),
               message: self.message.clone(),
               trace: Vec::new(),
               origin: None }
    }

    /// ¿Fue recibido desde una contraparte?
    pub fn is_received(&self) -> bool {
        self.origin.is_some()
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowError {
    #[error("{0}")]
    Application(ApplicationError),
    #[error("unexpected flow end: {message}")]
    UnexpectedEnd { message: String },
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl FlowError {
    /// Atajo para levantar un error declarado desde un routine.
    pub fn application(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application(ApplicationError::new(kind, message))
    }

    /// La contraparte terminó (normal o con error no declarado) o envió algo
    /// que no corresponde al tipo esperado.
    pub fn counterparty_ended(party: &Party, expected: &str) -> Self {
        Self::UnexpectedEnd { message: format!("Counterparty flow on {party} has ended unexpectedly; expected {expected}") }
    }

    /// La sesión fue rechazada por la contraparte.
    pub fn session_rejected(party: &Party, expected: &str, reason: &str) -> Self {
        Self::UnexpectedEnd { message: format!("{expected} was expected from {party} but the session was rejected: {reason}") }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Application(e) => e.message.clone(),
            Self::UnexpectedEnd { message } => message.clone(),
            Self::InvalidUsage(m) | Self::Internal(m) => m.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("checkpoint fingerprint mismatch for flow {0}")]
    FingerprintMismatch(FlowId),
    #[error("unsupported checkpoint format version {0}")]
    UnsupportedFormat(u32),
    #[error("unknown routine '{0}' (not registered for restore)")]
    UnknownRoutine(String),
    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("recipient {0} is unreachable")]
    Unreachable(Party),
    #[error("transport closed")]
    Closed,
}

impl From<CodecError> for FlowError {
    fn from(e: CodecError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<CheckpointError> for FlowError {
    fn from(e: CheckpointError) -> Self {
        Self::Internal(e.to_string())
    }
}

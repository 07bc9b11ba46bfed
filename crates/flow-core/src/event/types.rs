//! Eventos de ciclo de vida de los flows.
//!
//! Rol en el orquestador:
//! - Cada transición relevante (arranque, checkpoint, suspensión,
//!   restauración, fin) se agrega a un `EventStore` append-only.
//! - No participan en la recuperación (eso es responsabilidad de los
//!   checkpoints); sirven para observabilidad y para tests.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FlowId, Party};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowEventKind {
    /// Primer evento de un flow. `initiated_by` es la contraparte que lo
    /// creó (solo responders).
    FlowStarted { routine: String, initiated_by: Option<Party> },
    /// Checkpoint persistido.
    Checkpointed { sequence: u64 },
    /// El flow quedó aparcado esperando algo.
    Suspended { wait: String },
    /// Flow reconstruido desde checkpoint tras un reinicio.
    Restored { sequence: u64 },
    FlowCompleted,
    FlowFailed { error: String },
}

impl FlowEventKind {
    /// Letra compacta para secuencias en tests/logs.
    pub fn letter(&self) -> &'static str {
        match self {
            Self::FlowStarted { .. } => "S",
            Self::Checkpointed { .. } => "K",
            Self::Suspended { .. } => "P",
            Self::Restored { .. } => "R",
            Self::FlowCompleted => "C",
            Self::FlowFailed { .. } => "F",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub seq: u64, // asignado por el store (orden append)
    pub flow_id: FlowId,
    pub kind: FlowEventKind,
    pub ts: DateTime<Utc>,
}

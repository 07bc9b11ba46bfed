//! Snapshot durable de un flow suspendido.
//!
//! Invariantes:
//! - Se toma siempre en una frontera consistente (ningún frame a medias).
//! - `sequence` crece estrictamente por flow; cada checkpoint reemplaza al
//!   anterior.
//! - La forma serializada lleva un fingerprint (blake3 sobre JSON canónico)
//!   que se verifica al abrirla.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Codec;
use crate::constants::CHECKPOINT_FORMAT_VERSION;
use crate::errors::{CheckpointError, CodecError};
use super::fingerprint::fingerprint;
use crate::model::{FlowId, FlowStatus, Party, SessionId};
use crate::protocol::OutboundMessage;
use crate::session::FlowSession;

/// Un frame de la pila de continuación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub routine: String,
    pub state: Value,
    /// Contrapartes con las que este frame ya abrió sesión.
    pub initiated: Vec<Party>,
}

/// Condición de espera del frame superior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitCondition {
    Receive { session: SessionId, expected: String },
    CounterpartyInfo { session: SessionId },
    External { key: String },
}

impl WaitCondition {
    pub fn describe(&self) -> String {
        match self {
            Self::Receive { session, expected } => format!("receive {expected} on {session}"),
            Self::CounterpartyInfo { session } => format!("counterparty info on {session}"),
            Self::External { key } => format!("external '{key}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub flow_id: FlowId,
    pub sequence: u64,
    pub status: FlowStatus,
    pub frames: Vec<FrameRecord>,
    /// Tabla de sesiones en orden de creación (incluye inboxes).
    pub sessions: Vec<FlowSession>,
    /// `None` solo en el checkpoint inicial: el flow arranca con `Start`.
    pub wait: Option<WaitCondition>,
    /// Mensajes producidos desde la suspensión anterior.
    pub outbox: Vec<OutboundMessage>,
    pub initiated_by: Option<SessionId>,
    pub signals: Vec<(String, Value)>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Serializa y sella con fingerprint.
    pub fn seal(&self, codec: &dyn Codec) -> Result<SerializedCheckpoint, CheckpointError> {
        let value = serde_json::to_value(self).map_err(|e| CodecError::Encode(e.to_string()))?;
        let sealed = fingerprint(&value);
        let bytes = codec.encode_value(&value)?;
        Ok(SerializedCheckpoint { flow_id: self.flow_id,
                                  sequence: self.sequence,
                                  fingerprint: sealed,
                                  bytes })
    }
}

/// Forma persistida de un `Checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedCheckpoint {
    pub flow_id: FlowId,
    pub sequence: u64,
    pub fingerprint: String,
    pub bytes: Vec<u8>,
}

impl SerializedCheckpoint {
    /// Decodifica verificando fingerprint y versión de formato.
    pub fn open(&self, codec: &dyn Codec) -> Result<Checkpoint, CheckpointError> {
        let value = codec.decode_value(&self.bytes)?;
        if fingerprint(&value) != self.fingerprint {
            return Err(CheckpointError::FingerprintMismatch(self.flow_id));
        }
        let checkpoint: Checkpoint = serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))?;
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedFormat(checkpoint.format_version));
        }
        Ok(checkpoint)
    }
}

/// Resultado terminal registrado junto al borrado del checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOutcome {
    pub flow_id: FlowId,
    pub status: FlowStatus,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

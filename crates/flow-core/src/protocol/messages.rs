//! Vocabulario fijo de mensajes de sesión.
//!
//! Ciclo de vida: `SessionInit` → (`SessionConfirm` | `SessionReject`) →
//! `SessionData`* → (`NormalSessionEnd` | `ErrorSessionEnd`).

use serde::{Deserialize, Serialize};

use crate::errors::ApplicationError;
use crate::model::{Payload, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionMessage {
    SessionInit {
        initiator_session_id: SessionId,
        protocol_name: String,
        protocol_version: u32,
        app_identifier: String,
        first_payload: Option<Payload>,
    },
    SessionConfirm {
        initiator_session_id: SessionId,
        initiated_session_id: SessionId,
        protocol_version: u32,
        app_identifier: String,
    },
    SessionReject {
        initiator_session_id: SessionId,
        error_message: String,
    },
    SessionData {
        recipient_session_id: SessionId,
        payload: Payload,
    },
    NormalSessionEnd {
        recipient_session_id: SessionId,
    },
    ErrorSessionEnd {
        recipient_session_id: SessionId,
        error_response: Option<ApplicationError>,
    },
}

impl SessionMessage {
    /// Sesión local del receptor a la que va dirigido el mensaje. `None`
    /// para `SessionInit`, que crea una sesión nueva.
    pub fn recipient_session(&self) -> Option<SessionId> {
        match self {
            Self::SessionInit { .. } => None,
            Self::SessionConfirm { initiator_session_id, .. } | Self::SessionReject { initiator_session_id, .. } => Some(*initiator_session_id),
            Self::SessionData { recipient_session_id, .. }
            | Self::NormalSessionEnd { recipient_session_id }
            | Self::ErrorSessionEnd { recipient_session_id, .. } => Some(*recipient_session_id),
        }
    }

    /// Nombre corto para logs.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "SessionInit",
            Self::SessionConfirm { .. } => "SessionConfirm",
            Self::SessionReject { .. } => "SessionReject",
            Self::SessionData { .. } => "SessionData",
            Self::NormalSessionEnd { .. } => "NormalSessionEnd",
            Self::ErrorSessionEnd { .. } => "ErrorSessionEnd",
        }
    }
}

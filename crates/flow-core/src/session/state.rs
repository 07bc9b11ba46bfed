use serde::{Deserialize, Serialize};

use crate::errors::ApplicationError;
use crate::model::{Payload, SessionId};

/// Cómo terminó la contraparte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEnd {
    Normal,
    /// `None` = error no declarado (sin detalle).
    Error(Option<ApplicationError>),
}

/// Estado del protocolo de una sesión.
///
/// `Uninitiated → Initiating → Live → Ended`, o `Initiating → Rejected`.
/// `Ended` y `Rejected` son terminales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    Uninitiated,
    /// `SessionInit` enviado; los payloads enviados mientras tanto esperan
    /// al `SessionConfirm`.
    Initiating { pending: Vec<Payload> },
    Live { peer_session: SessionId },
    Ended { end: SessionEnd },
    Rejected { reason: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Rejected { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitiated => "uninitiated",
            Self::Initiating { .. } => "initiating",
            Self::Live { .. } => "live",
            Self::Ended { .. } => "ended",
            Self::Rejected { .. } => "rejected",
        }
    }
}

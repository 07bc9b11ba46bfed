//! Una conversación lógica entre un flow y una contraparte.
//!
//! `FlowSession` es una máquina de estados pura: las transiciones devuelven
//! los mensajes a emitir y el orquestador decide cuándo enviarlos (siempre
//! después de persistir el checkpoint correspondiente).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::{SessionEnd, SessionState};
use crate::errors::FlowError;
use crate::model::{FlowInfo, Party, Payload, ProtocolDecl, SessionId};
use crate::protocol::SessionMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSession {
    pub id: SessionId,
    pub counterparty: Party,
    /// Protocolo bajo el que se abrió la sesión.
    pub protocol: ProtocolDecl,
    /// Versión/aplicación de la contraparte, conocida al pasar a `Live`.
    pub peer_info: Option<FlowInfo>,
    pub state: SessionState,
    /// Payloads recibidos aún no consumidos (FIFO).
    pub inbox: VecDeque<Payload>,
}

impl FlowSession {
    /// Sesión abierta localmente, aún sin mensajes enviados.
    pub fn initiating(id: SessionId, counterparty: Party, protocol: ProtocolDecl) -> Self {
        Self { id,
               counterparty,
               protocol,
               peer_info: None,
               state: SessionState::Uninitiated,
               inbox: VecDeque::new() }
    }

    /// Sesión creada por un `SessionInit` entrante: nace `Live`.
    pub fn initiated(id: SessionId,
                     counterparty: Party,
                     protocol: ProtocolDecl,
                     peer_info: FlowInfo,
                     peer_session: SessionId)
                     -> Self {
        Self { id,
               counterparty,
               protocol,
               peer_info: Some(peer_info),
               state: SessionState::Live { peer_session },
               inbox: VecDeque::new() }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Initiating { .. } | SessionState::Live { .. })
    }

    fn init_message(&self, app_name: &str, first_payload: Option<Payload>) -> SessionMessage {
        SessionMessage::SessionInit { initiator_session_id: self.id,
                                      protocol_name: self.protocol.name.clone(),
                                      protocol_version: self.protocol.version,
                                      app_identifier: app_name.to_string(),
                                      first_payload }
    }

    /// Envío de un payload. Nunca suspende.
    pub fn send(&mut self, payload: Payload, app_name: &str) -> Result<Option<SessionMessage>, FlowError> {
        match &mut self.state {
            SessionState::Uninitiated => {
                let init = self.init_message(app_name, Some(payload));
                self.state = SessionState::Initiating { pending: Vec::new() };
                Ok(Some(init))
            }
            SessionState::Initiating { pending } => {
                pending.push(payload);
                Ok(None)
            }
            SessionState::Live { peer_session } => Ok(Some(SessionMessage::SessionData { recipient_session_id: *peer_session,
                                                                                        payload })),
            SessionState::Ended { .. } => Err(FlowError::UnexpectedEnd { message: format!("Cannot send to {}: counterparty flow has already ended",
                                                                                          self.counterparty) }),
            SessionState::Rejected { reason } => Err(FlowError::UnexpectedEnd { message: format!("Cannot send to {}: the session was rejected: {reason}",
                                                                                                 self.counterparty) }),
        }
    }

    /// Emite `SessionInit` sin payload si la sesión aún no se abrió (p.ej.
    /// cuando lo primero que hace el routine es recibir).
    pub fn ensure_initiated(&mut self, app_name: &str) -> Option<SessionMessage> {
        if matches!(self.state, SessionState::Uninitiated) {
            let init = self.init_message(app_name, None);
            self.state = SessionState::Initiating { pending: Vec::new() };
            return Some(init);
        }
        None
    }

    /// `SessionConfirm`: pasa a `Live` y devuelve los payloads retenidos
    /// como `SessionData`, en orden.
    pub fn on_confirm(&mut self, peer_session: SessionId, info: FlowInfo) -> Vec<SessionMessage> {
        let pending = match &mut self.state {
            SessionState::Initiating { pending } => std::mem::take(pending),
            _ => return Vec::new(),
        };
        self.state = SessionState::Live { peer_session };
        self.peer_info = Some(info);
        pending.into_iter()
               .map(|payload| SessionMessage::SessionData { recipient_session_id: peer_session,
                                                            payload })
               .collect()
    }

    pub fn on_reject(&mut self, reason: String) {
        if matches!(self.state, SessionState::Initiating { .. } | SessionState::Uninitiated) {
            self.state = SessionState::Rejected { reason };
        }
    }

    pub fn on_data(&mut self, payload: Payload) {
        if !self.state.is_terminal() {
            self.inbox.push_back(payload);
        }
    }

    pub fn on_end(&mut self, end: SessionEnd) {
        if !self.state.is_terminal() {
            self.state = SessionState::Ended { end };
        }
    }

    /// Resuelve una espera de recepción, si es posible ya.
    ///
    /// Los datos encolados se consumen antes de observar el fin. Un payload
    /// con etiqueta distinta a `expected` cuenta como fin inesperado.
    pub fn take_received(&mut self, expected: &str) -> Option<Result<Payload, FlowError>> {
        if let Some(payload) = self.inbox.pop_front() {
            if !payload.is_a(expected) {
                return Some(Err(FlowError::counterparty_ended(&self.counterparty, expected)));
            }
            return Some(Ok(payload));
        }
        match &self.state {
            SessionState::Ended { end: SessionEnd::Error(Some(e)) } => {
                let mut received = e.clone();
                received.origin = Some(self.id);
                Some(Err(FlowError::Application(received)))
            }
            SessionState::Ended { .. } => Some(Err(FlowError::counterparty_ended(&self.counterparty, expected))),
            SessionState::Rejected { reason } => Some(Err(FlowError::session_rejected(&self.counterparty, expected, reason))),
            _ => None,
        }
    }

    /// Resuelve una espera de `FlowInfo` de la contraparte.
    pub fn info_outcome(&self) -> Option<Result<FlowInfo, FlowError>> {
        if let Some(info) = &self.peer_info {
            return Some(Ok(info.clone()));
        }
        match &self.state {
            SessionState::Rejected { reason } => Some(Err(FlowError::session_rejected(&self.counterparty, "FlowInfo", reason))),
            SessionState::Ended { .. } => Some(Err(FlowError::counterparty_ended(&self.counterparty, "FlowInfo"))),
            _ => None,
        }
    }

    /// Mensaje de cierre hacia la contraparte. Solo posible en `Live`.
    pub fn end_message(&self, end: &SessionEnd) -> Option<SessionMessage> {
        let SessionState::Live { peer_session } = self.state else {
            return None;
        };
        Some(match end {
            SessionEnd::Normal => SessionMessage::NormalSessionEnd { recipient_session_id: peer_session },
            SessionEnd::Error(e) => SessionMessage::ErrorSessionEnd { recipient_session_id: peer_session,
                                                                     error_response: e.clone() },
        })
    }
}

//! Contexto de ejecución que recibe un routine en cada `resume`.
//!
//! Expone las operaciones no suspendentes sobre las sesiones del flow
//! (abrir, enviar, consultar). Las operaciones que suspenden se expresan
//! devolviendo un `Step`.

use indexmap::IndexMap;

use crate::errors::FlowError;
use crate::model::{FlowId, FlowInfo, Party, Payload, PayloadType, ProtocolDecl, SessionId};
use crate::protocol::OutboundMessage;
use crate::session::FlowSession;

pub struct FlowCtx<'a> {
    flow_id: FlowId,
    our_identity: &'a Party,
    app_name: &'a str,
    /// Protocolo del frame iniciador más cercano en la pila.
    protocol: Option<ProtocolDecl>,
    sessions: &'a mut IndexMap<SessionId, FlowSession>,
    outbox: &'a mut Vec<OutboundMessage>,
    /// Contrapartes ya iniciadas por el frame actual.
    initiated: &'a mut Vec<Party>,
}

impl<'a> FlowCtx<'a> {
    pub(crate) fn new(flow_id: FlowId,
                      our_identity: &'a Party,
                      app_name: &'a str,
                      protocol: Option<ProtocolDecl>,
                      sessions: &'a mut IndexMap<SessionId, FlowSession>,
                      outbox: &'a mut Vec<OutboundMessage>,
                      initiated: &'a mut Vec<Party>)
                      -> Self {
        Self { flow_id,
               our_identity,
               app_name,
               protocol,
               sessions,
               outbox,
               initiated }
    }

    #[inline]
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    #[inline]
    pub fn our_identity(&self) -> &Party {
        self.our_identity
    }

    /// Abre una sesión con `party`. No envía nada hasta el primer `send` o
    /// la primera espera sobre la sesión.
    pub fn initiate_flow(&mut self, party: &Party) -> Result<SessionId, FlowError> {
        let protocol = self.protocol.clone().ok_or_else(|| {
                                                 FlowError::InvalidUsage("initiate_flow() requires an initiating routine on the stack".into())
                                             })?;
        if self.initiated.contains(party) {
            return Err(FlowError::InvalidUsage(format!("Attempted to initiate_flow() twice in the same routine for the same party {party}")));
        }
        let session = FlowSession::initiating(SessionId::new(), party.clone(), protocol);
        let id = session.id;
        self.sessions.insert(id, session);
        self.initiated.push(party.clone());
        Ok(id)
    }

    /// Envía `value` por `session`. Nunca suspende.
    pub fn send<T: PayloadType>(&mut self, session: SessionId, value: &T) -> Result<(), FlowError> {
        let payload = Payload::of(value)?;
        let s = self.sessions
                    .get_mut(&session)
                    .ok_or_else(|| FlowError::InvalidUsage(format!("session {session} does not belong to this flow")))?;
        if let Some(message) = s.send(payload, self.app_name)? {
            self.outbox.push(OutboundMessage::new(s.counterparty.clone(), message));
        }
        Ok(())
    }

    pub fn counterparty(&self, session: SessionId) -> Option<&Party> {
        self.sessions.get(&session).map(|s| &s.counterparty)
    }

    /// `FlowInfo` de la contraparte si ya se conoce. Para esperar a que se
    /// conozca, devolver `Step::CounterpartyInfo`.
    pub fn counterparty_info(&self, session: SessionId) -> Option<FlowInfo> {
        self.sessions.get(&session).and_then(|s| s.peer_info.clone())
    }

    /// Sesiones del flow en orden de creación.
    pub fn sessions(&self) -> impl Iterator<Item = &FlowSession> {
        self.sessions.values()
    }
}

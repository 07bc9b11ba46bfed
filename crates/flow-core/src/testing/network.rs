//! Red en memoria determinista para tests multi-nodo.
//!
//! - Una cola FIFO por destinatario.
//! - `run_network` bombea en rondas: en cada ronda cada nodo (en orden de
//!   creación) consume un mensaje, lo entrega y espera a que el nodo se
//!   estabilice. Termina cuando una ronda no entrega nada.
//! - Los mensajes para un nodo caído quedan en cola hasta que se reinicia.
//! - Cada entrega queda registrada como `SessionTransfer` con el mensaje
//!   saneado (sin ids de sesión) para asertar secuencias exactas.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, warn};
use serde_json::Value;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::codec::{Codec, JsonCodec};
use crate::engine::{EngineConfig, FlowOrchestrator};
use crate::errors::{ApplicationError, FlowError, TransportError};
use crate::model::{MessageId, Party};
use crate::protocol::{Envelope, SessionMessage};
use crate::registry::ProtocolRegistry;
use crate::transport::Transport;

/// Vista saneada de un mensaje de sesión.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Init { protocol: String, version: u32, payload: Option<Value> },
    Confirm { version: u32 },
    Reject { reason: String },
    Data(Value),
    NormalEnd,
    ErrorEnd(Option<ApplicationError>),
}

impl From<&SessionMessage> for TransferEvent {
    fn from(message: &SessionMessage) -> Self {
        match message {
            SessionMessage::SessionInit { protocol_name,
                                          protocol_version,
                                          first_payload,
                                          .. } => Self::Init { protocol: protocol_name.clone(),
                                                               version: *protocol_version,
                                                               payload: first_payload.as_ref().map(|p| p.value.clone()) },
            SessionMessage::SessionConfirm { protocol_version, .. } => Self::Confirm { version: *protocol_version },
            SessionMessage::SessionReject { error_message, .. } => Self::Reject { reason: error_message.clone() },
            SessionMessage::SessionData { payload, .. } => Self::Data(payload.value.clone()),
            SessionMessage::NormalSessionEnd { .. } => Self::NormalEnd,
            SessionMessage::ErrorSessionEnd { error_response, .. } => Self::ErrorEnd(error_response.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionTransfer {
    pub from: Party,
    pub to: Party,
    pub event: TransferEvent,
}

impl SessionTransfer {
    pub fn new(from: &Party, to: &Party, event: TransferEvent) -> Self {
        Self { from: from.clone(),
               to: to.clone(),
               event }
    }
}

struct NodeSlot {
    config: EngineConfig,
    registry: Arc<ProtocolRegistry>,
    store: Arc<InMemoryCheckpointStore>,
    /// Lo que ve el orquestador; por defecto el mismo `store`.
    backend: Arc<dyn CheckpointStore>,
    orchestrator: Option<FlowOrchestrator>,
}

#[derive(Default)]
struct NetworkState {
    queues: IndexMap<Party, VecDeque<Envelope>>,
    transfers: Vec<SessionTransfer>,
}

/// Transporte de un nodo: encola en la red compartida.
struct NodeTransport {
    state: Arc<Mutex<NetworkState>>,
}

#[async_trait]
impl Transport for NodeTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| TransportError::Closed)?;
        state.queues.entry(envelope.recipient.clone()).or_default().push_back(envelope);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    nodes: Arc<Mutex<IndexMap<Party, NodeSlot>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_nodes(&self) -> MutexGuard<'_, IndexMap<Party, NodeSlot>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn build(&self, party: &Party, slot: &NodeSlot) -> FlowOrchestrator {
        let transport = Arc::new(NodeTransport { state: self.state.clone() });
        FlowOrchestrator::builder(party.clone()).transport(transport)
                                                .config(slot.config.clone())
                                                .registry(slot.registry.clone())
                                                .checkpoint_store(slot.backend.clone())
                                                .build()
    }

    /// Crea un nodo con configuración por defecto (`app_name` = nombre).
    pub fn create_node(&self, name: &str, registry: ProtocolRegistry) -> FlowOrchestrator {
        self.create_node_with_config(name, registry, EngineConfig::default().with_app_name(name))
    }

    pub fn create_node_with_config(&self, name: &str, registry: ProtocolRegistry, config: EngineConfig) -> FlowOrchestrator {
        self.create_node_with_store(name, registry, config, |store| store as Arc<dyn CheckpointStore>)
    }

    /// Crea un nodo cuyo store es `wrap` aplicado al store en memoria del
    /// nodo (p.ej. para inyectar fallos). `checkpoint_store` sigue
    /// devolviendo el store en memoria; los reinicios reutilizan `wrap`.
    pub fn create_node_with_store<F>(&self,
                                     name: &str,
                                     registry: ProtocolRegistry,
                                     config: EngineConfig,
                                     wrap: F)
                                     -> FlowOrchestrator
        where F: FnOnce(Arc<InMemoryCheckpointStore>) -> Arc<dyn CheckpointStore>
    {
        let party = Party::new(name);
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut slot = NodeSlot { config,
                                  registry: Arc::new(registry),
                                  backend: wrap(store.clone()),
                                  store,
                                  orchestrator: None };
        let node = self.build(&party, &slot);
        slot.orchestrator = Some(node.clone());
        self.lock_nodes().insert(party, slot);
        node
    }

    pub fn node(&self, party: &Party) -> Option<FlowOrchestrator> {
        self.lock_nodes().get(party).and_then(|s| s.orchestrator.clone())
    }

    pub fn checkpoint_store(&self, party: &Party) -> Option<Arc<InMemoryCheckpointStore>> {
        self.lock_nodes().get(party).map(|s| s.store.clone())
    }

    /// Simula la caída del nodo: deja de recibir, su store sobrevive.
    /// Conviene hacer `flush` antes para no dejar trabajo en curso.
    pub fn crash(&self, party: &Party) {
        if let Some(slot) = self.lock_nodes().get_mut(party) {
            slot.orchestrator = None;
        }
    }

    /// Reinicia un nodo caído sobre el mismo store y restaura sus flows.
    pub fn restart(&self, party: &Party) -> Result<FlowOrchestrator, FlowError> {
        let node = {
            let mut nodes = self.lock_nodes();
            let slot = nodes.get_mut(party)
                            .ok_or_else(|| FlowError::InvalidUsage(format!("unknown node {party}")))?;
            let node = self.build(party, slot);
            slot.orchestrator = Some(node.clone());
            node
        };
        let restored = node.restore()?;
        debug!("network:restart party={party} restored={restored}");
        Ok(node)
    }

    /// Inyecta un mensaje arbitrario como si lo enviara `from`.
    pub fn send_raw(&self, from: &Party, to: &Party, message: &SessionMessage) -> Result<(), FlowError> {
        let codec: &dyn Codec = &JsonCodec;
        let envelope = Envelope { message_id: MessageId::new(),
                                  sender: from.clone(),
                                  recipient: to.clone(),
                                  body: codec.encode(message)? };
        self.lock_state().queues.entry(to.clone()).or_default().push_back(envelope);
        Ok(())
    }

    fn online_nodes(&self) -> Vec<(Party, FlowOrchestrator)> {
        self.lock_nodes()
            .iter()
            .filter_map(|(p, s)| s.orchestrator.clone().map(|o| (p.clone(), o)))
            .collect()
    }

    async fn flush_all(&self) {
        for (_, node) in self.online_nodes() {
            node.flush().await;
        }
    }

    /// Entrega a `node` el siguiente mensaje en cola para `party` y espera a
    /// que el nodo se estabilice.
    async fn deliver_next(&self, party: &Party, node: &FlowOrchestrator) -> bool {
        let next = self.lock_state().queues.get_mut(party).and_then(|q| q.pop_front());
        let Some(envelope) = next else {
            return false;
        };
        let codec: &dyn Codec = &JsonCodec;
        match codec.decode::<SessionMessage>(&envelope.body) {
            Ok(message) => {
                let transfer = SessionTransfer { from: envelope.sender.clone(),
                                                 to: party.clone(),
                                                 event: TransferEvent::from(&message) };
                self.lock_state().transfers.push(transfer);
            }
            Err(e) => warn!("network:undecodable message to={party} error={e}"),
        }
        if let Err(e) = node.deliver(envelope).await {
            warn!("network:deliver failed to={party} error={e}");
        }
        node.flush().await;
        true
    }

    /// Entrega un único mensaje pendiente a `party`.
    pub async fn pump_receive(&self, party: &Party) -> bool {
        let Some(node) = self.node(party) else {
            return false;
        };
        node.flush().await;
        self.deliver_next(party, &node).await
    }

    /// Bombea mensajes hasta que la red quede en reposo. Devuelve cuántos
    /// mensajes se entregaron.
    pub async fn run_network(&self) -> usize {
        self.flush_all().await;
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for (party, node) in self.online_nodes() {
                if self.deliver_next(&party, &node).await {
                    delivered += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        delivered
    }

    /// Transferencias en las que participa `party`, en orden de entrega.
    pub fn transfers_with(&self, party: &Party) -> Vec<SessionTransfer> {
        self.lock_state()
            .transfers
            .iter()
            .filter(|t| &t.from == party || &t.to == party)
            .cloned()
            .collect()
    }

    pub fn transfers(&self) -> Vec<SessionTransfer> {
        self.lock_state().transfers.clone()
    }

    pub fn clear_transfers(&self) {
        self.lock_state().transfers.clear();
    }

    /// Mensajes aún en cola para `party` (p.ej. mientras está caído).
    pub fn pending_for(&self, party: &Party) -> usize {
        self.lock_state().queues.get(party).map(VecDeque::len).unwrap_or(0)
    }
}

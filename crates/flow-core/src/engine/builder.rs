//! Builder para `FlowOrchestrator`.
//!
//! Patrón en dos estados:
//! - `OrchestratorBuilderInit`: solo conoce la identidad del nodo; lo único
//!   obligatorio que falta es el transporte.
//! - `OrchestratorBuilder`: colaboradores opcionales con defaults en
//!   memoria (checkpoints, eventos), codec JSON, registro vacío y
//!   `EngineConfig::default()`.
//!
//! ```ignore
//! let node = FlowOrchestrator::builder(Party::new("Alice"))
//!     .transport(transport)
//!     .registry(registry)
//!     .checkpoint_store(store)
//!     .build();
//! ```

use std::sync::Arc;

use super::{EngineConfig, FlowOrchestrator};
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::codec::{Codec, JsonCodec};
use crate::event::{EventStore, InMemoryEventStore};
use crate::model::Party;
use crate::registry::ProtocolRegistry;
use crate::transport::Transport;

/// Estado inicial del builder.
#[derive(Debug)]
pub struct OrchestratorBuilderInit {
    pub identity: Party,
}

impl OrchestratorBuilderInit {
    #[inline]
    pub fn transport(self, transport: Arc<dyn Transport>) -> OrchestratorBuilder {
        OrchestratorBuilder { identity: self.identity,
                              transport,
                              config: EngineConfig::default(),
                              registry: None,
                              store: None,
                              codec: None,
                              events: None }
    }
}

pub struct OrchestratorBuilder {
    identity: Party,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    registry: Option<Arc<ProtocolRegistry>>,
    store: Option<Arc<dyn CheckpointStore>>,
    codec: Option<Arc<dyn Codec>>,
    events: Option<Box<dyn EventStore>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<ProtocolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn event_store(mut self, events: Box<dyn EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> FlowOrchestrator {
        FlowOrchestrator::from_parts(self.identity,
                                     self.config,
                                     self.registry.unwrap_or_default(),
                                     self.store.unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
                                     self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
                                     self.transport,
                                     self.events.unwrap_or_else(|| Box::new(InMemoryEventStore::default())))
    }
}

use std::collections::HashMap;
use chrono::Utc;

use super::{FlowEvent, FlowEventKind};
use crate::model::FlowId;

/// Almacenamiento de eventos append-only.
pub trait EventStore: Send {
    /// Agrega un evento a partir de su kind y devuelve el evento completo (con seq y ts).
    fn append_kind(&mut self, flow_id: FlowId, kind: FlowEventKind) -> FlowEvent;
    /// Lista eventos de un flujo (orden ascendente por seq).
    fn list(&self, flow_id: FlowId) -> Vec<FlowEvent>;
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    pub inner: HashMap<FlowId, Vec<FlowEvent>>,
}

impl EventStore for InMemoryEventStore {
    fn append_kind(&mut self, flow_id: FlowId, kind: FlowEventKind) -> FlowEvent {
        let events = self.inner.entry(flow_id).or_default();
        let ev = FlowEvent { seq: events.len() as u64,
                             flow_id,
                             kind,
                             ts: Utc::now() };
        events.push(ev.clone());
        ev
    }

    fn list(&self, flow_id: FlowId) -> Vec<FlowEvent> {
        self.inner.get(&flow_id).cloned().unwrap_or_default()
    }
}

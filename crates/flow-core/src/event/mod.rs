//! Eventos de ciclo de vida y trait EventStore.

mod store;
mod types;

pub use store::{EventStore, InMemoryEventStore};
pub use types::{FlowEvent, FlowEventKind};

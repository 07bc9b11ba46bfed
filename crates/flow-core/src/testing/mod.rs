//! Utilidades de test: red multi-nodo en memoria.

mod network;

pub use network::{InMemoryNetwork, SessionTransfer, TransferEvent};

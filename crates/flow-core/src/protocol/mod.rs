//! Protocolo de sesión: mensajes y sobres de transporte.

mod envelope;
mod messages;

pub use envelope::{Envelope, OutboundMessage};
pub use messages::SessionMessage;

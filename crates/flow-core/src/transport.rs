//! Interfaces hacia el transporte de mensajes.
//!
//! Entrega at-least-once, sin orden garantizado entre sesiones distintas.
//! El orden dentro de una sesión lo preserva el buzón FIFO de cada flow.

use async_trait::async_trait;

use crate::errors::TransportError;
use crate::protocol::Envelope;

/// Salida hacia la red.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Entrada desde la red: el transporte invoca este handler por cada sobre
/// recibido.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, envelope: Envelope);
}

use serde::{Deserialize, Serialize};

use super::SessionMessage;
use crate::model::{MessageId, Party};

/// Unidad de transporte: un mensaje de sesión codificado más su
/// direccionamiento.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub sender: Party,
    pub recipient: Party,
    pub body: Vec<u8>,
}

/// Mensaje pendiente de envío. Forma parte del checkpoint para poder
/// reenviarse con el mismo `message_id` tras un reinicio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub recipient: Party,
    pub message: SessionMessage,
}

impl OutboundMessage {
    pub fn new(recipient: Party, message: SessionMessage) -> Self {
        Self { message_id: MessageId::new(),
               recipient,
               message }
    }
}

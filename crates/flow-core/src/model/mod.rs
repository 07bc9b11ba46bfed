//! Tipos de modelo compartidos: identificadores, información de protocolo,
//! payloads y estado de ciclo de vida.

pub mod ids;
pub mod info;
pub mod payload;
pub mod status;

pub use ids::{FlowId, MessageId, Party, SessionId};
pub use info::{FlowInfo, ProtocolDecl};
pub use payload::{Payload, PayloadType};
pub use status::FlowStatus;

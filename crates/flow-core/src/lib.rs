//! flow-core: orquestación de flows multi-parte con sesiones punto a punto,
//! checkpoints en cada suspensión y deduplicación de mensajes.
pub mod checkpoint;
pub mod codec;
pub mod constants;
pub mod dedup;
pub mod engine;
pub mod errors;
pub mod event;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod routine;
pub mod session;
pub mod testing;
pub mod transport;

pub use checkpoint::{Checkpoint, CheckpointStore, FlowOutcome, InMemoryCheckpointStore, SerializedCheckpoint};
pub use codec::{Codec, JsonCodec};
pub use dedup::DeduplicationCache;
pub use engine::{EngineConfig, FlowCtx, FlowHandle, FlowOrchestrator, FlowResult};
pub use errors::{ApplicationError, CheckpointError, CodecError, FlowError, TransportError};
pub use event::{EventStore, FlowEvent, FlowEventKind, InMemoryEventStore};
pub use model::{FlowId, FlowInfo, FlowStatus, MessageId, Party, Payload, PayloadType, ProtocolDecl,
                SessionId};
pub use protocol::{Envelope, SessionMessage};
pub use registry::ProtocolRegistry;
pub use routine::{to_state, FlowRoutine, Resume, Step};
pub use transport::{InboundHandler, Transport};

//! Engine: orquestador, builder, contexto de routines y configuración.

pub mod builder;
pub mod config;
pub mod core;
mod driver;
mod finished;
pub mod flow_ctx;
mod runtime;

pub use builder::{OrchestratorBuilder, OrchestratorBuilderInit};
pub use config::EngineConfig;
pub use self::core::{FlowHandle, FlowOrchestrator, FlowResult};
pub use flow_ctx::FlowCtx;

//! Routines: la lógica de negocio de un flow expresada como máquina de
//! estados serializable.
//!
//! Rol en el orquestador:
//! - Un flow es una pila de frames; cada frame es un `FlowRoutine` con su
//!   estado local.
//! - El orquestador llama `resume` con un `Resume`; el routine trabaja de
//!   forma síncrona (puede enviar por sus sesiones vía `FlowCtx`) y
//!   devuelve un `Step` que indica dónde suspender, qué sub-flow ejecutar o
//!   con qué valor termina.
//! - Entre dos `Step`s el routine nunca cede el control; cada suspensión es
//!   un punto de checkpoint, por eso el estado debe poder serializarse
//!   (`save_state`) y reconstruirse desde el registro.

mod step;

use serde::Serialize;
use serde_json::Value;

use crate::engine::FlowCtx;
use crate::errors::{CodecError, FlowError};
use crate::model::ProtocolDecl;

pub use step::{Resume, Step};

pub trait FlowRoutine: Send + 'static {
    /// Nombre estable con el que se registró para restauración.
    fn routine_name(&self) -> &str;

    /// Protocolo bajo el que este routine inicia sesiones. Los routines
    /// "inlined" devuelven `None` y heredan el del frame inferior.
    fn initiating(&self) -> Option<ProtocolDecl> {
        None
    }

    fn resume(&mut self, ctx: &mut FlowCtx<'_>, input: Resume) -> Result<Step, FlowError>;

    /// Estado local para el checkpoint.
    fn save_state(&self) -> Result<Value, CodecError>;
}

/// Helper para implementar `save_state` en routines `Serialize`.
pub fn to_state<T: Serialize>(routine: &T) -> Result<Value, CodecError> {
    serde_json::to_value(routine).map_err(|e| CodecError::Encode(e.to_string()))
}

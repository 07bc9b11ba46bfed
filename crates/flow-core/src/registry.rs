//! Registro de protocolos por nodo.
//!
//! Sustituye la reflexión por registro explícito:
//! - `register`: factoría de responders por nombre de protocolo (+ versión
//!   anunciada en el `SessionConfirm`).
//! - `register_routine`: tipos de routine restaurables desde checkpoint.
//!   También cuentan como "flows conocidos" para el mensaje de rechazo.
//! - `register_data_type`: nombres conocidos que no son flows.
//!
//! Cada nodo posee su propio registro; no hay estado global.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{CheckpointError, CodecError};
use crate::model::SessionId;
use crate::routine::FlowRoutine;

/// Construye el routine responder para una sesión entrante.
pub type ResponderFactory = Arc<dyn Fn(SessionId) -> Box<dyn FlowRoutine> + Send + Sync>;

/// Reconstruye un routine desde su estado serializado.
pub type RestoreFn = fn(Value) -> Result<Box<dyn FlowRoutine>, CodecError>;

#[derive(Clone)]
pub struct ResponderEntry {
    pub version: u32,
    pub factory: ResponderFactory,
}

#[derive(Default)]
pub struct ProtocolRegistry {
    responders: DashMap<String, ResponderEntry>,
    routines: DashMap<String, RestoreFn>,
    data_types: DashSet<String>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra el responder de `protocol_name`.
    pub fn register<F>(&self, protocol_name: &str, version: u32, factory: F)
        where F: Fn(SessionId) -> Box<dyn FlowRoutine> + Send + Sync + 'static
    {
        debug!("registry:register protocol={protocol_name} version={version}");
        self.responders.insert(protocol_name.to_string(),
                               ResponderEntry { version,
                                                factory: Arc::new(factory) });
    }

    pub fn resolve(&self, protocol_name: &str) -> Option<ResponderEntry> {
        self.responders.get(protocol_name).map(|e| e.value().clone())
    }

    /// Registra un tipo de routine restaurable bajo `name` (debe coincidir
    /// con su `routine_name()`).
    pub fn register_routine<T>(&self, name: &str)
        where T: FlowRoutine + DeserializeOwned
    {
        let restore: RestoreFn = |state| {
            serde_json::from_value::<T>(state).map(|r| Box::new(r) as Box<dyn FlowRoutine>)
                                              .map_err(|e| CodecError::Decode(e.to_string()))
        };
        self.routines.insert(name.to_string(), restore);
    }

    pub fn register_data_type(&self, name: &str) {
        self.data_types.insert(name.to_string());
    }

    pub fn is_known_routine(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }

    /// Motivo de rechazo para un `SessionInit` sin responder.
    pub fn rejection_reason(&self, protocol_name: &str) -> String {
        if self.is_known_routine(protocol_name) {
            format!("{protocol_name} is not registered")
        } else if self.data_types.contains(protocol_name) {
            format!("{protocol_name} is not a flow")
        } else {
            format!("Don't know {protocol_name}")
        }
    }

    pub fn restore(&self, name: &str, state: Value) -> Result<Box<dyn FlowRoutine>, CheckpointError> {
        let restore = self.routines
                          .get(name)
                          .map(|r| *r.value())
                          .ok_or_else(|| CheckpointError::UnknownRoutine(name.to_string()))?;
        Ok(restore(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlowCtx;
    use crate::errors::FlowError;
    use crate::routine::{to_state, Resume, Step};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Echo {
        n: i64,
    }

    impl FlowRoutine for Echo {
        fn routine_name(&self) -> &str {
            "echo"
        }
        fn resume(&mut self, _ctx: &mut FlowCtx<'_>, _input: Resume) -> Result<Step, FlowError> {
            Step::done(&self.n)
        }
        fn save_state(&self) -> Result<Value, CodecError> {
            to_state(self)
        }
    }

    #[test]
    fn rejection_reasons_distinguish_known_names() {
        let reg = ProtocolRegistry::new();
        reg.register_routine::<Echo>("echo");
        reg.register_data_type("money.Amount");
        assert_eq!(reg.rejection_reason("echo"), "echo is not registered");
        assert_eq!(reg.rejection_reason("money.Amount"), "money.Amount is not a flow");
        assert_eq!(reg.rejection_reason("not.a.real.Class"), "Don't know not.a.real.Class");
        assert!(reg.resolve("echo").is_none());
    }

    #[test]
    fn restore_rebuilds_registered_routine() {
        let reg = ProtocolRegistry::new();
        reg.register_routine::<Echo>("echo");
        let r = reg.restore("echo", serde_json::json!({"n": 7})).unwrap();
        assert_eq!(r.routine_name(), "echo");
        assert_eq!(r.save_state().unwrap(), serde_json::json!({"n": 7}));
        assert!(matches!(reg.restore("missing", Value::Null), Err(CheckpointError::UnknownRoutine(_))));
        assert!(matches!(reg.restore("echo", serde_json::json!("bad")), Err(CheckpointError::Codec(_))));
    }

    #[test]
    fn resolve_returns_registered_version() {
        let reg = ProtocolRegistry::new();
        reg.register("echo", 3, |_| Box::new(Echo { n: 1 }));
        let entry = reg.resolve("echo").unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!((entry.factory)(SessionId::new()).routine_name(), "echo");
    }
}

//! Puntos de suspensión (`Step`) y entradas de reanudación (`Resume`).

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::FlowRoutine;
use crate::errors::FlowError;
use crate::model::{FlowInfo, Party, Payload, PayloadType, SessionId};

/// Lo que un routine pide al orquestador al devolver el control.
pub enum Step {
    /// Suspender hasta recibir un payload del tipo `expected` por `session`.
    Receive { session: SessionId, expected: String },
    /// Suspender hasta conocer la `FlowInfo` de la contraparte.
    CounterpartyInfo { session: SessionId },
    /// Suspender hasta una señal externa local con esta clave.
    WaitExternal { key: String },
    /// Ejecutar un sub-flow; su resultado vuelve como `Resume::SubFlow`.
    SubFlow(Box<dyn FlowRoutine>),
    /// Terminar este frame con un valor.
    Done(Value),
}

impl Step {
    pub fn receive<T: PayloadType>(session: SessionId) -> Self {
        Self::Receive { session,
                        expected: T::type_tag().into_owned() }
    }

    pub fn wait_external(key: impl Into<String>) -> Self {
        Self::WaitExternal { key: key.into() }
    }

    pub fn sub_flow<R: FlowRoutine>(routine: R) -> Self {
        Self::SubFlow(Box::new(routine))
    }

    pub fn done<T: Serialize>(value: &T) -> Result<Self, FlowError> {
        serde_json::to_value(value).map(Self::Done)
                                   .map_err(|e| FlowError::Internal(format!("result encode: {e}")))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receive { session, expected } => write!(f, "Receive({session}, {expected})"),
            Self::CounterpartyInfo { session } => write!(f, "CounterpartyInfo({session})"),
            Self::WaitExternal { key } => write!(f, "WaitExternal({key})"),
            Self::SubFlow(r) => write!(f, "SubFlow({})", r.routine_name()),
            Self::Done(v) => write!(f, "Done({v})"),
        }
    }
}

/// Entrada con la que se reanuda un frame.
#[derive(Debug)]
pub enum Resume {
    Start,
    Received {
        session: SessionId,
        from: Party,
        expected: String,
        payload: Result<Payload, FlowError>,
    },
    CounterpartyInfo {
        session: SessionId,
        info: Result<FlowInfo, FlowError>,
    },
    SubFlow(Result<Value, FlowError>),
    External { key: String, value: Value },
}

impl Resume {
    fn mismatch(&self, wanted: &str) -> FlowError {
        FlowError::InvalidUsage(format!("expected {wanted} resume, got {}", self.kind()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Received { .. } => "Received",
            Self::CounterpartyInfo { .. } => "CounterpartyInfo",
            Self::SubFlow(_) => "SubFlow",
            Self::External { .. } => "External",
        }
    }

    /// Payload recibido como `T`. Un payload que no decodifica como `T`
    /// equivale a un fin inesperado de la contraparte.
    pub fn received<T: PayloadType>(self) -> Result<T, FlowError> {
        match self {
            Self::Received { from, payload, .. } => {
                let payload = payload?;
                payload.decode::<T>()
                       .map_err(|_| FlowError::counterparty_ended(&from, &T::type_tag()))
            }
            other => Err(other.mismatch("Received")),
        }
    }

    pub fn counterparty_info(self) -> Result<FlowInfo, FlowError> {
        match self {
            Self::CounterpartyInfo { info, .. } => info,
            other => Err(other.mismatch("CounterpartyInfo")),
        }
    }

    /// Resultado del sub-flow como `T`. Los errores del hijo se propagan tal
    /// cual, el padre puede capturarlos.
    pub fn sub_flow<T: DeserializeOwned>(self) -> Result<T, FlowError> {
        match self {
            Self::SubFlow(result) => {
                let value = result?;
                serde_json::from_value(value).map_err(|e| FlowError::Internal(format!("sub-flow result decode: {e}")))
            }
            other => Err(other.mismatch("SubFlow")),
        }
    }

    /// Resultado crudo del sub-flow, sin propagar el error.
    pub fn sub_flow_result(self) -> Result<Result<Value, FlowError>, FlowError> {
        match self {
            Self::SubFlow(result) => Ok(result),
            other => Err(other.mismatch("SubFlow")),
        }
    }

    pub fn external<T: DeserializeOwned>(self) -> Result<T, FlowError> {
        match self {
            Self::External { value, .. } => {
                serde_json::from_value(value).map_err(|e| FlowError::InvalidUsage(format!("external signal decode: {e}")))
            }
            other => Err(other.mismatch("External")),
        }
    }
}

//! Protocolo de ejemplo `flowmesh.squares`.
//!
//! El iniciador abre sesión con el servidor, anuncia cuántos valores va a
//! enviar (como primer payload del init) y luego manda cada valor esperando
//! su cuadrado antes del siguiente. El servidor termina tras atender la
//! cantidad anunciada.

use std::sync::Arc;

use async_trait::async_trait;
use flow_core::testing::InMemoryNetwork;
use flow_core::{to_state, CodecError, Envelope, FlowCtx, FlowError, FlowOrchestrator, FlowRoutine, Party,
                ProtocolDecl, ProtocolRegistry, Resume, SessionId, Step, Transport, TransportError};
use flow_persistence::{build_dev_pool_from_env, PgCheckpointStore, PoolProvider};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AppConfig;
use crate::errors::AppError;

pub const SQUARES_PROTOCOL: &str = "flowmesh.squares";

#[derive(Debug, Serialize, Deserialize)]
pub struct SquaresFlow {
    pub server: Party,
    pub values: Vec<i64>,
    pub session: Option<SessionId>,
    pub squares: Vec<i64>,
}

impl SquaresFlow {
    pub fn new(server: Party, values: Vec<i64>) -> Self {
        Self { server,
               values,
               session: None,
               squares: Vec::new() }
    }

    fn session(&self) -> Result<SessionId, FlowError> {
        self.session.ok_or_else(|| FlowError::InvalidUsage("squares session not opened".into()))
    }

    fn ask_next(&mut self, ctx: &mut FlowCtx<'_>) -> Result<Step, FlowError> {
        let session = self.session()?;
        match self.values.get(self.squares.len()) {
            Some(v) => {
                ctx.send(session, v)?;
                Ok(Step::receive::<i64>(session))
            }
            None => Step::done(&self.squares),
        }
    }
}

/// Cantidad anunciada al servidor; no cabe en `u32` es un uso inválido.
fn announced_count(len: usize) -> Result<u32, FlowError> {
    u32::try_from(len).map_err(|_| FlowError::InvalidUsage(format!("cannot announce {len} values")))
}

impl FlowRoutine for SquaresFlow {
    fn routine_name(&self) -> &str {
        "SquaresFlow"
    }

    fn initiating(&self) -> Option<ProtocolDecl> {
        Some(ProtocolDecl::new(SQUARES_PROTOCOL, 1))
    }

    fn resume(&mut self, ctx: &mut FlowCtx<'_>, input: Resume) -> Result<Step, FlowError> {
        if let Resume::Start = input {
            let session = ctx.initiate_flow(&self.server)?;
            self.session = Some(session);
            ctx.send(session, &announced_count(self.values.len())?)?;
            return self.ask_next(ctx);
        }
        let square: i64 = input.received()?;
        self.squares.push(square);
        self.ask_next(ctx)
    }

    fn save_state(&self) -> Result<Value, CodecError> {
        to_state(self)
    }
}

/// Responder: atiende tantos valores como anunció el iniciador.
#[derive(Debug, Serialize, Deserialize)]
pub struct SquareServerFlow {
    pub session: SessionId,
    pub expected: Option<u32>,
    pub served: u32,
}

impl SquareServerFlow {
    pub fn new(session: SessionId) -> Self {
        Self { session,
               expected: None,
               served: 0 }
    }
}

impl FlowRoutine for SquareServerFlow {
    fn routine_name(&self) -> &str {
        "SquareServerFlow"
    }

    fn resume(&mut self, ctx: &mut FlowCtx<'_>, input: Resume) -> Result<Step, FlowError> {
        match input {
            Resume::Start => return Ok(Step::receive::<u32>(self.session)),
            input if self.expected.is_none() => {
                self.expected = Some(input.received::<u32>()?);
            }
            input => {
                let v: i64 = input.received()?;
                let square = v.checked_mul(v)
                              .ok_or_else(|| FlowError::application("Overflow", format!("{v} squared overflows")))?;
                ctx.send(self.session, &square)?;
                self.served += 1;
            }
        }
        if Some(self.served) == self.expected {
            return Step::done(&self.served);
        }
        Ok(Step::receive::<i64>(self.session))
    }

    fn save_state(&self) -> Result<Value, CodecError> {
        to_state(self)
    }
}

/// Registro de un nodo que habla `flowmesh.squares` en ambos roles.
pub fn demo_registry() -> ProtocolRegistry {
    let registry = ProtocolRegistry::new();
    registry.register_routine::<SquaresFlow>("SquaresFlow");
    registry.register_routine::<SquareServerFlow>("SquareServerFlow");
    registry.register(SQUARES_PROTOCOL, 1, |session| Box::new(SquareServerFlow::new(session)));
    registry
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquaresReport {
    pub squares: Vec<i64>,
    pub served: u32,
    pub transfers: usize,
}

/// Corre el protocolo entre dos nodos de una red en memoria.
pub async fn run_squares(values: Vec<i64>) -> Result<SquaresReport, AppError> {
    let net = InMemoryNetwork::new();
    let client = net.create_node("Client", demo_registry());
    let server = net.create_node("Server", demo_registry());

    let handle = client.start(SquaresFlow::new(server.identity().clone(), values))?;
    let delivered = net.run_network().await;
    info!("demo:squares flow_id={} delivered={delivered}", handle.id);

    let squares: Vec<i64> = handle.result_as().await?;
    let served = match server.finished_results("SquareServerFlow").pop() {
        Some(result) => serde_json::from_value(result?).map_err(|e| FlowError::Internal(e.to_string()))?,
        None => return Err(AppError::Config("server flow did not finish".into())),
    };
    Ok(SquaresReport { squares,
                       served,
                       transfers: net.transfers().len() })
}

/// Transporte que descarta todo; la demo Postgres solo restaura.
struct DiscardTransport;

#[async_trait]
impl Transport for DiscardTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        log::debug!("demo:discard to={} message_id={}", envelope.recipient, envelope.message_id);
        Ok(())
    }
}

/// Restaura los flows con checkpoint en Postgres y devuelve cuántos quedaron
/// vivos.
pub async fn run_pg_restore(config: &AppConfig) -> Result<usize, AppError> {
    let pool = build_dev_pool_from_env()?;
    let store = PgCheckpointStore::new(PoolProvider { pool });
    let node = FlowOrchestrator::builder(Party::new(config.engine.app_name.clone())).transport(Arc::new(DiscardTransport))
                                                                                     .config(config.engine.clone())
                                                                                     .registry(Arc::new(demo_registry()))
                                                                                     .checkpoint_store(Arc::new(store))
                                                                                     .build();
    let restored = node.restore()?;
    node.flush().await;
    info!("demo:pg_restore restored={restored} live={}", node.live_flows().len());
    Ok(node.live_flows().len())
}

//! Orquestador de flows (state machine manager).
//!
//! Responsable de:
//! - Arrancar flows locales (`start`) y responders (`SessionInit` entrante).
//! - Enrutar mensajes de sesión al buzón del flow dueño (`deliver`).
//! - Reanudar flows en el pool de workers, persistiendo un checkpoint en
//!   cada suspensión antes de enviar lo producido (ver `driver`).
//! - Aplicar la política de propagación de errores al terminar.
//! - Restaurar flows aparcados tras un reinicio (`restore`).
//!
//! Un único worker posee el token de ejecución de un flow a la vez; flows
//! distintos avanzan en paralelo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Semaphore};

use super::finished::FinishedFlows;
use super::runtime::{FlowEntry, FlowRuntime, Inbound};
use super::{EngineConfig, OrchestratorBuilderInit};
use crate::checkpoint::CheckpointStore;
use crate::codec::Codec;
use crate::dedup::DeduplicationCache;
use crate::errors::FlowError;
use crate::event::{EventStore, FlowEvent, FlowEventKind};
use crate::model::{FlowId, FlowInfo, FlowStatus, Party, Payload, ProtocolDecl, SessionId};
use crate::protocol::{Envelope, OutboundMessage, SessionMessage};
use crate::registry::ProtocolRegistry;
use crate::routine::FlowRoutine;
use crate::session::{FlowSession, SessionEnd};
use crate::transport::{InboundHandler, Transport};

pub type FlowResult = Result<Value, FlowError>;

/// Resultado futuro de un flow.
#[derive(Debug)]
pub struct FlowHandle {
    pub id: FlowId,
    result: oneshot::Receiver<FlowResult>,
}

impl FlowHandle {
    pub async fn result(self) -> FlowResult {
        self.result
            .await
            .unwrap_or_else(|_| Err(FlowError::Internal("orchestrator shut down before the flow finished".into())))
    }

    pub async fn result_as<T: DeserializeOwned>(self) -> Result<T, FlowError> {
        let value = self.result().await?;
        serde_json::from_value(value).map_err(|e| FlowError::Internal(format!("result decode: {e}")))
    }
}

/// Sesión que seguía `Initiating` cuando su flow terminó: se cierra al
/// llegar el `SessionConfirm`, o se descarta pasado `orphan_timeout`.
pub(super) struct OrphanSession {
    pub session: FlowSession,
    pub end: SessionEnd,
    pub since: Instant,
}

pub(super) struct Inner {
    pub identity: Party,
    pub config: EngineConfig,
    pub registry: Arc<ProtocolRegistry>,
    pub store: Arc<dyn CheckpointStore>,
    pub codec: Arc<dyn Codec>,
    pub transport: Arc<dyn Transport>,
    pub events: Mutex<Box<dyn EventStore>>,
    pub dedup: DeduplicationCache,
    pub flows: DashMap<FlowId, Arc<FlowEntry>>,
    pub session_index: DashMap<SessionId, FlowId>,
    pub orphans: DashMap<SessionId, OrphanSession>,
    pub finished: FinishedFlows,
    pub waiters: Mutex<HashMap<FlowId, Vec<oneshot::Sender<FlowResult>>>>,
    pub workers: Arc<Semaphore>,
    pub in_flight: watch::Sender<usize>,
    pub live: watch::Sender<usize>,
    pub stopping: AtomicBool,
}

/// Orquestador de un nodo. Clonable (comparte estado interno).
#[derive(Clone)]
pub struct FlowOrchestrator {
    pub(super) inner: Arc<Inner>,
}

impl std::fmt::Debug for FlowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowOrchestrator").finish_non_exhaustive()
    }
}

impl FlowOrchestrator {
    /// Crea un builder para el nodo `identity`.
    #[inline]
    pub fn builder(identity: Party) -> OrchestratorBuilderInit {
        OrchestratorBuilderInit { identity }
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn from_parts(identity: Party,
                             config: EngineConfig,
                             registry: Arc<ProtocolRegistry>,
                             store: Arc<dyn CheckpointStore>,
                             codec: Arc<dyn Codec>,
                             transport: Arc<dyn Transport>,
                             events: Box<dyn EventStore>)
                             -> Self {
        let (in_flight, _) = watch::channel(0usize);
        let (live, _) = watch::channel(0usize);
        let inner = Inner { dedup: DeduplicationCache::new(config.dedup_capacity),
                            finished: FinishedFlows::new(config.finished_capacity),
                            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
                            identity,
                            config,
                            registry,
                            store,
                            codec,
                            transport,
                            events: Mutex::new(events),
                            flows: DashMap::new(),
                            session_index: DashMap::new(),
                            orphans: DashMap::new(),
                            waiters: Mutex::new(HashMap::new()),
                            in_flight,
                            live,
                            stopping: AtomicBool::new(false) };
        Self { inner: Arc::new(inner) }
    }

    pub fn identity(&self) -> &Party {
        &self.inner.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.inner.registry
    }

    /// Arranca un flow local. Escribe el checkpoint inicial y lo programa;
    /// no espera a que avance. Debe llamarse dentro de un runtime tokio.
    pub fn start<R: FlowRoutine>(&self, routine: R) -> Result<FlowHandle, FlowError> {
        self.start_boxed(Box::new(routine))
    }

    pub fn start_boxed(&self, routine: Box<dyn FlowRoutine>) -> Result<FlowHandle, FlowError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(FlowError::InvalidUsage("orchestrator is stopping; no new flows are accepted".into()));
        }
        let flow_id = FlowId::new();
        let (tx, rx) = oneshot::channel();
        self.lock_waiters().insert(flow_id, vec![tx]);
        if let Err(e) = self.launch(flow_id, FlowRuntime::new(routine), None) {
            self.lock_waiters().remove(&flow_id);
            return Err(e);
        }
        Ok(FlowHandle { id: flow_id,
                        result: rx })
    }

    /// Entrega un sobre entrante.
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), FlowError> {
        if self.inner.dedup.check_duplicate(envelope.message_id) {
            debug!("deliver:duplicate party={} message_id={} from={}",
                   self.inner.identity, envelope.message_id, envelope.sender);
            return Ok(());
        }
        let message: SessionMessage = self.inner.codec.decode(&envelope.body)?;
        self.expire_orphans();
        let from = envelope.sender;
        debug!("deliver:message party={} from={from} kind={}",
               self.inner.identity,
               message.variant_name());
        match message {
            SessionMessage::SessionInit { initiator_session_id,
                                          protocol_name,
                                          protocol_version,
                                          app_identifier,
                                          first_payload, } => {
                let peer_info = FlowInfo { flow_version: protocol_version,
                                           app_name: app_identifier };
                self.on_session_init(from, initiator_session_id, protocol_name, peer_info, first_payload)
                    .await;
            }
            other => self.route(from, other).await,
        }
        Ok(())
    }

    async fn on_session_init(&self,
                             from: Party,
                             initiator_session: SessionId,
                             protocol_name: String,
                             peer_info: FlowInfo,
                             first_payload: Option<Payload>) {
        if self.is_stopping() {
            warn!("deliver:reject party={} from={from} protocol={protocol_name} reason=stopping",
                  self.inner.identity);
            let reason = format!("{} is stopping and accepts no new flows", self.inner.identity);
            self.reject(from, initiator_session, reason).await;
            return;
        }
        let Some(responder) = self.inner.registry.resolve(&protocol_name) else {
            let reason = self.inner.registry.rejection_reason(&protocol_name);
            warn!("deliver:reject party={} from={from} protocol={protocol_name} reason={reason}",
                  self.inner.identity);
            self.reject(from, initiator_session, reason).await;
            return;
        };

        let flow_id = FlowId::new();
        let session_id = SessionId::new();
        let mut session = FlowSession::initiated(session_id,
                                                 from.clone(),
                                                 ProtocolDecl::new(protocol_name.clone(), responder.version),
                                                 peer_info,
                                                 initiator_session);
        if let Some(payload) = first_payload {
            session.on_data(payload);
        }
        let mut rt = FlowRuntime::new((responder.factory)(session_id));
        let confirm = SessionMessage::SessionConfirm { initiator_session_id: initiator_session,
                                                       initiated_session_id: session_id,
                                                       protocol_version: responder.version,
                                                       app_identifier: self.inner.config.app_name.clone() };
        rt.outbox.push(OutboundMessage::new(from.clone(), confirm));
        rt.sessions.insert(session_id, session);
        rt.initiated_by = Some(session_id);

        if let Err(e) = self.launch(flow_id, rt, Some(from.clone())) {
            error!("deliver:responder launch failed party={} protocol={protocol_name} error={e}",
                   self.inner.identity);
            self.reject(from, initiator_session, format!("{protocol_name} could not be started")).await;
        }
    }

    async fn reject(&self, to: Party, initiator_session: SessionId, reason: String) {
        let reject = SessionMessage::SessionReject { initiator_session_id: initiator_session,
                                                     error_message: reason };
        self.send_message(OutboundMessage::new(to, reject)).await;
    }

    async fn route(&self, from: Party, message: SessionMessage) {
        let Some(target) = message.recipient_session() else {
            return;
        };
        let flow_id = self.inner.session_index.get(&target).map(|f| *f.value());
        let entry = flow_id.and_then(|id| self.inner.flows.get(&id).map(|e| e.value().clone()));
        if let Some(entry) = entry {
            entry.push(Inbound::Message { from, message });
            self.schedule(entry);
            return;
        }
        match message {
            SessionMessage::SessionConfirm { initiator_session_id,
                                             initiated_session_id,
                                             protocol_version,
                                             app_identifier, } => {
                let info = FlowInfo { flow_version: protocol_version,
                                      app_name: app_identifier };
                self.close_orphan(initiator_session_id, initiated_session_id, info).await;
            }
            SessionMessage::SessionReject { initiator_session_id, .. } => {
                self.inner.orphans.remove(&initiator_session_id);
            }
            other => {
                debug!("deliver:drop party={} from={from} kind={} session={target} (no live flow)",
                       self.inner.identity,
                       other.variant_name());
            }
        }
    }

    /// Cierra una sesión huérfana ahora que se conoce la sesión remota:
    /// primero los payloads retenidos, luego el fin.
    async fn close_orphan(&self, session: SessionId, peer_session: SessionId, info: FlowInfo) {
        let Some((_, mut orphan)) = self.inner.orphans.remove(&session) else {
            debug!("deliver:confirm for unknown session {session}");
            return;
        };
        let to = orphan.session.counterparty.clone();
        let mut messages = orphan.session.on_confirm(peer_session, info);
        messages.extend(orphan.session.end_message(&orphan.end));
        for m in messages {
            self.send_message(OutboundMessage::new(to.clone(), m)).await;
        }
    }

    /// Descarta las sesiones huérfanas que llevan más de `orphan_timeout`
    /// esperando su `SessionConfirm`.
    pub(super) fn expire_orphans(&self) {
        let timeout = self.inner.config.orphan_timeout;
        self.inner.orphans.retain(|id, orphan| {
                              let keep = orphan.since.elapsed() < timeout;
                              if !keep {
                                  warn!("orphan:expired party={} session={id} counterparty={}",
                                        self.inner.identity,
                                        orphan.session.counterparty);
                              }
                              keep
                          });
    }

    /// Sesiones huérfanas aún pendientes de `SessionConfirm`.
    pub fn orphan_count(&self) -> usize {
        self.inner.orphans.len()
    }

    /// Entrega una señal externa a un flow que espera `WaitExternal(key)`.
    pub fn signal(&self, flow_id: FlowId, key: impl Into<String>, value: Value) -> Result<(), FlowError> {
        let entry = self.inner
                        .flows
                        .get(&flow_id)
                        .map(|e| e.value().clone())
                        .ok_or_else(|| FlowError::InvalidUsage(format!("unknown or finished flow {flow_id}")))?;
        entry.push(Inbound::Signal { key: key.into(),
                                     value });
        self.schedule(entry);
        Ok(())
    }

    /// Restaura todos los flows con checkpoint en el store. Los checkpoints
    /// que no abren (fingerprint, routine desconocido) se registran y se
    /// omiten. Devuelve cuántos flows se restauraron.
    pub fn restore(&self) -> Result<usize, FlowError> {
        let all = self.inner.store.load_all()?;
        let mut restored = 0;
        for sealed in all {
            let flow_id = sealed.flow_id;
            if self.inner.flows.contains_key(&flow_id) {
                continue;
            }
            let runtime = sealed.open(&*self.inner.codec)
                                .and_then(|cp| FlowRuntime::from_checkpoint(cp, &self.inner.registry));
            let rt = match runtime {
                Ok(rt) => rt,
                Err(e) => {
                    error!("restore:skip party={} flow_id={flow_id} error={e}", self.inner.identity);
                    continue;
                }
            };
            let status = if rt.started { FlowStatus::Suspended } else { FlowStatus::Created };
            info!("restore:flow party={} flow_id={flow_id} routine={} sequence={} pending_outbox={}",
                  self.inner.identity,
                  rt.root,
                  rt.sequence,
                  rt.outbox.len());
            let sequence = rt.sequence;
            for id in rt.sessions.keys() {
                self.inner.session_index.insert(*id, flow_id);
            }
            let entry = Arc::new(FlowEntry::new(flow_id, rt, status));
            self.inner.flows.insert(flow_id, entry.clone());
            self.inner.live.send_modify(|n| *n += 1);
            self.record(flow_id, FlowEventKind::Restored { sequence });
            self.schedule(entry);
            restored += 1;
        }
        Ok(restored)
    }

    /// Suscribe al resultado de un flow vivo o ya terminado.
    pub fn result_of(&self, flow_id: FlowId) -> Option<FlowHandle> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock_waiters();
        if let Some(result) = self.inner.finished.result(flow_id) {
            let _ = tx.send(result);
        } else if self.inner.flows.contains_key(&flow_id) {
            waiters.entry(flow_id).or_default().push(tx);
        } else {
            return None;
        }
        Some(FlowHandle { id: flow_id,
                          result: rx })
    }

    pub fn status(&self, flow_id: FlowId) -> Option<FlowStatus> {
        if let Some(entry) = self.inner.flows.get(&flow_id) {
            return Some(entry.status());
        }
        self.inner
            .finished
            .result(flow_id)
            .map(|r| if r.is_ok() { FlowStatus::Completed } else { FlowStatus::Failed })
    }

    pub fn live_flows(&self) -> Vec<FlowId> {
        self.inner.flows.iter().map(|e| *e.key()).collect()
    }

    /// Resultados retenidos de flows terminados cuyo routine raíz es
    /// `routine`, en orden de terminación.
    pub fn finished_results(&self, routine: &str) -> Vec<FlowResult> {
        self.inner.finished.results_for(routine)
    }

    pub fn finished_count(&self) -> usize {
        self.inner.finished.len()
    }

    pub fn events_for(&self, flow_id: FlowId) -> Vec<FlowEvent> {
        self.inner.events.lock().unwrap_or_else(|e| e.into_inner()).list(flow_id)
    }

    /// Secuencia compacta de eventos (ver `FlowEventKind::letter`).
    pub fn event_variants(&self, flow_id: FlowId) -> Vec<&'static str> {
        self.events_for(flow_id).iter().map(|e| e.kind.letter()).collect()
    }

    /// Espera a que no quede ninguna reanudación en curso.
    pub async fn flush(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        loop {
            let n = *rx.borrow_and_update();
            if n == 0 || rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Detiene el orquestador: rechaza nuevos `start` y `SessionInit`, deja que lo que está
    /// en curso llegue a su próxima suspensión y espera a que queden como
    /// mucho `acceptable_live_on_stop` flows vivos.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let acceptable = self.inner.config.acceptable_live_on_stop;
        info!("orchestrator:stop party={} acceptable_live={acceptable}", self.inner.identity);
        self.flush().await;
        let mut rx = self.inner.live.subscribe();
        loop {
            let n = *rx.borrow_and_update();
            if n <= acceptable || rx.changed().await.is_err() {
                break;
            }
        }
        info!("orchestrator:stopped party={} live={}", self.inner.identity, self.inner.flows.len());
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    pub(super) fn lock_waiters(&self) -> std::sync::MutexGuard<'_, HashMap<FlowId, Vec<oneshot::Sender<FlowResult>>>> {
        self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn record(&self, flow_id: FlowId, kind: FlowEventKind) {
        self.inner.events.lock().unwrap_or_else(|e| e.into_inner()).append_kind(flow_id, kind);
    }
}

#[async_trait]
impl InboundHandler for FlowOrchestrator {
    async fn on_message(&self, envelope: Envelope) {
        let message_id = envelope.message_id;
        if let Err(e) = self.deliver(envelope).await {
            error!("deliver:failed party={} message_id={message_id} error={e}", self.inner.identity);
        }
    }
}

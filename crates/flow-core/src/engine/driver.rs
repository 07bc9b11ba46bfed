//! Bucle de ejecución de un flow bajo su token.
//!
//! Secuencia por reanudación:
//! 1. Aplicar el buzón (mensajes de sesión y señales) al runtime.
//! 2. Si la espera actual se puede satisfacer, ejecutar frames de forma
//!    síncrona hasta la próxima suspensión o el fin.
//! 3. En cada suspensión: checkpoint → envío del outbox → volver a 1.
//! 4. Sin nada listo: checkpoint si hubo cambios, envío, aparcar.
//! 5. Al terminar: `CheckpointStore::finish` primero; solo si se registra se
//!    envían los fines de sesión y se publica el resultado.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use super::core::{FlowOrchestrator, FlowResult, OrphanSession};
use super::finished::FinishedFlow;
use super::flow_ctx::FlowCtx;
use super::runtime::{Frame, FlowEntry, FlowRuntime, Inbound};
use crate::checkpoint::{FlowOutcome, WaitCondition};
use crate::constants::FINISH_RETRIES;
use crate::errors::{CheckpointError, FlowError};
use crate::event::FlowEventKind;
use crate::model::{FlowId, FlowInfo, FlowStatus, Party, SessionId};
use crate::protocol::{Envelope, OutboundMessage, SessionMessage};
use crate::routine::{FlowRoutine, Resume, Step};
use crate::session::{SessionEnd, SessionState};

enum Progress {
    Suspended,
    Finished(FlowResult),
}

/// Qué hacer con el frame tras un `Step` válido.
enum Next {
    Push(Box<dyn FlowRoutine>),
    Value(serde_json::Value),
    Wait(WaitCondition),
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("routine panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("routine panicked: {s}")
    } else {
        "routine panicked".to_string()
    }
}

/// Fin que recibe cada sesión abierta según cómo terminó el flow.
///
/// Un error declarado recibido de una contraparte solo se reenvía río
/// arriba (a la sesión que creó este flow); el resto de sesiones se cierran
/// normalmente.
fn end_for(result: &FlowResult, session: SessionId, initiated_by: Option<SessionId>) -> SessionEnd {
    match result {
        Ok(_) => SessionEnd::Normal,
        Err(FlowError::Application(e)) if !e.is_received() || initiated_by == Some(session) => {
            SessionEnd::Error(Some(e.stripped()))
        }
        Err(FlowError::Application(_)) => SessionEnd::Normal,
        Err(_) => SessionEnd::Error(None),
    }
}

impl FlowOrchestrator {
    /// Escribe el checkpoint inicial, registra el flow y lo programa.
    pub(super) fn launch(&self, flow_id: FlowId, mut rt: FlowRuntime, initiator: Option<Party>) -> Result<(), FlowError> {
        let sealed = rt.snapshot(flow_id, FlowStatus::Created)?.seal(&*self.inner.codec)?;
        self.inner.store.save(&sealed)?;
        let routine = rt.root.clone();
        for id in rt.sessions.keys() {
            self.inner.session_index.insert(*id, flow_id);
        }
        let entry = Arc::new(FlowEntry::new(flow_id, rt, FlowStatus::Created));
        self.inner.flows.insert(flow_id, entry.clone());
        self.inner.live.send_modify(|n| *n += 1);
        info!("flow:start party={} flow_id={flow_id} routine={routine} initiated_by={}",
              self.inner.identity,
              initiator.as_ref().map(Party::name).unwrap_or("-"));
        self.record(flow_id, FlowEventKind::FlowStarted { routine,
                                                          initiated_by: initiator });
        self.record(flow_id, FlowEventKind::Checkpointed { sequence: sealed.sequence });
        self.schedule(entry);
        Ok(())
    }

    /// Programa una reanudación en el pool de workers.
    ///
    /// Como mucho una reanudación en cola por flow: si ya hay una que aún
    /// no drenó el buzón, esa recogerá lo nuevo. El token del flow se toma
    /// antes que el permiso del pool.
    pub(super) fn schedule(&self, entry: Arc<FlowEntry>) {
        if !entry.mark_queued() {
            return;
        }
        self.inner.in_flight.send_modify(|n| *n += 1);
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut rt = entry.runtime.lock().await;
                entry.clear_queued();
                match this.inner.workers.clone().acquire_owned().await {
                    Ok(_permit) => this.drive(&entry, &mut rt).await,
                    Err(e) => error!("flow:schedule worker pool closed flow_id={} error={e}", entry.id),
                }
            }
            this.inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    async fn drive(&self, entry: &FlowEntry, rt: &mut FlowRuntime) {
        if rt.finished {
            return;
        }
        if let Some(result) = rt.pending_result.take() {
            self.finish(entry, rt, result).await;
            return;
        }
        self.apply_mailbox(entry, rt);
        while let Some(input) = self.next_input(rt) {
            entry.set_status(FlowStatus::Running);
            match self.run_frames(entry.id, rt, input) {
                Progress::Suspended => {
                    if let Err(e) = self.persist(entry.id, rt) {
                        self.fail_on_checkpoint(entry, rt, e).await;
                        return;
                    }
                    self.flush_outbox(rt).await;
                    self.apply_mailbox(entry, rt);
                }
                Progress::Finished(result) => {
                    self.finish(entry, rt, result).await;
                    return;
                }
            }
        }
        if rt.dirty {
            if let Err(e) = self.persist(entry.id, rt) {
                self.fail_on_checkpoint(entry, rt, e).await;
                return;
            }
        }
        self.flush_outbox(rt).await;
        if rt.started && entry.status() != FlowStatus::Suspended {
            entry.set_status(FlowStatus::Suspended);
            if let Some(wait) = &rt.wait {
                debug!("flow:suspend party={} flow_id={} wait={}",
                       self.inner.identity,
                       entry.id,
                       wait.describe());
                self.record(entry.id, FlowEventKind::Suspended { wait: wait.describe() });
            }
        }
    }

    async fn fail_on_checkpoint(&self, entry: &FlowEntry, rt: &mut FlowRuntime, e: CheckpointError) {
        error!("flow:checkpoint failed party={} flow_id={} error={e}", self.inner.identity, entry.id);
        self.finish(entry, rt, Err(FlowError::Internal(format!("checkpoint failed: {e}")))).await;
    }

    fn persist(&self, flow_id: FlowId, rt: &mut FlowRuntime) -> Result<(), CheckpointError> {
        let sealed = rt.snapshot(flow_id, FlowStatus::Suspended)?.seal(&*self.inner.codec)?;
        self.inner.store.save(&sealed)?;
        rt.dirty = false;
        debug!("flow:checkpoint party={} flow_id={flow_id} sequence={} outbox={}",
               self.inner.identity,
               sealed.sequence,
               rt.outbox.len());
        self.record(flow_id, FlowEventKind::Checkpointed { sequence: sealed.sequence });
        Ok(())
    }

    fn apply_mailbox(&self, entry: &FlowEntry, rt: &mut FlowRuntime) {
        let inbound = entry.drain();
        if inbound.is_empty() {
            return;
        }
        rt.dirty = true;
        for item in inbound {
            match item {
                Inbound::Signal { key, value } => rt.signals.push((key, value)),
                Inbound::Message { from, message } => self.apply_message(entry.id, rt, from, message),
            }
        }
    }

    fn apply_message(&self, flow_id: FlowId, rt: &mut FlowRuntime, from: Party, message: SessionMessage) {
        let Some(target) = message.recipient_session() else {
            warn!("flow:unexpected {} in mailbox flow_id={flow_id}", message.variant_name());
            return;
        };
        let Some(session) = rt.sessions.get_mut(&target) else {
            warn!("flow:message for foreign session flow_id={flow_id} session={target}");
            return;
        };
        if session.counterparty != from {
            warn!("flow:ignoring {} from {from} on session with {} flow_id={flow_id}",
                  message.variant_name(),
                  session.counterparty);
            return;
        }
        match message {
            SessionMessage::SessionConfirm { initiated_session_id,
                                             protocol_version,
                                             app_identifier,
                                             .. } => {
                let info = FlowInfo { flow_version: protocol_version,
                                      app_name: app_identifier };
                let released = session.on_confirm(initiated_session_id, info);
                let to = session.counterparty.clone();
                rt.outbox.extend(released.into_iter().map(|m| OutboundMessage::new(to.clone(), m)));
            }
            SessionMessage::SessionReject { error_message, .. } => session.on_reject(error_message),
            SessionMessage::SessionData { payload, .. } => session.on_data(payload),
            SessionMessage::NormalSessionEnd { .. } => session.on_end(SessionEnd::Normal),
            SessionMessage::ErrorSessionEnd { error_response, .. } => session.on_end(SessionEnd::Error(error_response)),
            SessionMessage::SessionInit { .. } => {}
        }
    }

    /// Entrada con la que reanudar, si la espera actual ya se cumple.
    fn next_input(&self, rt: &mut FlowRuntime) -> Option<Resume> {
        if rt.frames.is_empty() {
            return None;
        }
        if !rt.started {
            rt.started = true;
            return Some(Resume::Start);
        }
        let resume = match rt.wait.as_ref()? {
            WaitCondition::Receive { session, expected } => {
                let names = rt.stack_names();
                let s = rt.sessions.get_mut(session)?;
                let payload = s.take_received(expected)?.map_err(|e| match e {
                                                                  FlowError::Application(mut app) => {
                                                                      app.trace = names;
                                                                      FlowError::Application(app)
                                                                  }
                                                                  other => other,
                                                              });
                Resume::Received { session: *session,
                                   from: s.counterparty.clone(),
                                   expected: expected.clone(),
                                   payload }
            }
            WaitCondition::CounterpartyInfo { session } => {
                let info = rt.sessions.get(session)?.info_outcome()?;
                Resume::CounterpartyInfo { session: *session,
                                           info }
            }
            WaitCondition::External { key } => {
                let idx = rt.signals.iter().position(|(k, _)| k == key)?;
                let (key, value) = rt.signals.remove(idx);
                Resume::External { key, value }
            }
        };
        rt.wait = None;
        Some(resume)
    }

    /// Ejecuta frames hasta una suspensión o hasta vaciar la pila.
    fn run_frames(&self, flow_id: FlowId, rt: &mut FlowRuntime, mut input: Resume) -> Progress {
        loop {
            let Some(mut frame) = rt.frames.pop() else {
                return Progress::Finished(Err(FlowError::Internal("empty frame stack".into())));
            };
            let protocol = frame.routine
                                .initiating()
                                .or_else(|| rt.frames.iter().rev().find_map(|f| f.routine.initiating()));
            let outcome = {
                let Frame { routine, initiated } = &mut frame;
                let mut ctx = FlowCtx::new(flow_id,
                                           &self.inner.identity,
                                           &self.inner.config.app_name,
                                           protocol,
                                           &mut rt.sessions,
                                           &mut rt.outbox,
                                           initiated);
                panic::catch_unwind(AssertUnwindSafe(|| routine.resume(&mut ctx, input)))
                    .unwrap_or_else(|p| Err(FlowError::Internal(panic_message(p))))
            };
            for id in rt.sessions.keys() {
                self.inner.session_index.entry(*id).or_insert(flow_id);
            }

            match outcome.and_then(|step| self.classify(rt, step)) {
                Ok(Next::Push(child)) => {
                    debug!("flow:subflow flow_id={flow_id} parent={} child={}",
                           frame.routine.routine_name(),
                           child.routine_name());
                    rt.frames.push(frame);
                    rt.frames.push(Frame::new(child));
                    input = Resume::Start;
                }
                Ok(Next::Value(value)) => {
                    if rt.frames.is_empty() {
                        return Progress::Finished(Ok(value));
                    }
                    input = Resume::SubFlow(Ok(value));
                }
                Ok(Next::Wait(wait)) => {
                    rt.wait = Some(wait);
                    rt.frames.push(frame);
                    return Progress::Suspended;
                }
                Err(mut error) => {
                    if let FlowError::Application(app) = &mut error {
                        if app.trace.is_empty() {
                            app.trace = rt.stack_names();
                            app.trace.push(frame.routine.routine_name().to_string());
                        }
                    }
                    debug!("flow:frame error flow_id={flow_id} routine={} error={error}",
                           frame.routine.routine_name());
                    if rt.frames.is_empty() {
                        return Progress::Finished(Err(error));
                    }
                    input = Resume::SubFlow(Err(error));
                }
            }
        }
    }

    /// Valida el `Step` y prepara la espera (abre la sesión si hace falta).
    fn classify(&self, rt: &mut FlowRuntime, step: Step) -> Result<Next, FlowError> {
        match step {
            Step::SubFlow(child) => Ok(Next::Push(child)),
            Step::Done(value) => Ok(Next::Value(value)),
            Step::Receive { session, expected } => {
                self.open_for_wait(rt, session)?;
                Ok(Next::Wait(WaitCondition::Receive { session, expected }))
            }
            Step::CounterpartyInfo { session } => {
                self.open_for_wait(rt, session)?;
                Ok(Next::Wait(WaitCondition::CounterpartyInfo { session }))
            }
            Step::WaitExternal { key } => Ok(Next::Wait(WaitCondition::External { key })),
        }
    }

    fn open_for_wait(&self, rt: &mut FlowRuntime, session: SessionId) -> Result<(), FlowError> {
        let s = rt.sessions
                  .get_mut(&session)
                  .ok_or_else(|| FlowError::InvalidUsage(format!("session {session} does not belong to this flow")))?;
        if let Some(init) = s.ensure_initiated(&self.inner.config.app_name) {
            rt.outbox.push(OutboundMessage::new(s.counterparty.clone(), init));
        }
        Ok(())
    }

    pub(super) async fn flush_outbox(&self, rt: &mut FlowRuntime) {
        let outbox = std::mem::take(&mut rt.outbox);
        for out in outbox {
            self.send_message(out).await;
        }
    }

    pub(super) async fn send_message(&self, out: OutboundMessage) {
        let body = match self.inner.codec.encode(&out.message) {
            Ok(body) => body,
            Err(e) => {
                error!("send:encode failed party={} kind={} error={e}",
                       self.inner.identity,
                       out.message.variant_name());
                return;
            }
        };
        debug!("send:message party={} to={} kind={} message_id={}",
               self.inner.identity,
               out.recipient,
               out.message.variant_name(),
               out.message_id);
        let envelope = Envelope { message_id: out.message_id,
                                  sender: self.inner.identity.clone(),
                                  recipient: out.recipient,
                                  body };
        if let Err(e) = self.inner.transport.send(envelope).await {
            warn!("send:failed party={} error={e}", self.inner.identity);
        }
    }

    /// Registra el resultado en el store, con reintentos cortos.
    async fn record_outcome(&self, outcome: &FlowOutcome) -> Result<(), CheckpointError> {
        let mut attempts = 0;
        loop {
            match self.inner.store.finish(outcome) {
                Err(e) if attempts < FINISH_RETRIES => {
                    attempts += 1;
                    let delay_ms = 15 * u64::from(attempts);
                    warn!("flow:finish retry party={} flow_id={} attempt={attempts} error={e} sleep_ms={delay_ms}",
                          self.inner.identity,
                          outcome.flow_id);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                r => return r,
            }
        }
    }

    /// Estado terminal: borra el checkpoint (registrando el resultado),
    /// cierra sesiones y publica el resultado.
    ///
    /// Si el store no acepta el fin, el flow queda aparcado con su último
    /// checkpoint y el resultado pendiente; la próxima reanudación lo
    /// reintenta. No se envía nada mientras tanto.
    async fn finish(&self, entry: &FlowEntry, rt: &mut FlowRuntime, result: FlowResult) {
        let flow_id = entry.id;
        rt.wait = None;
        let status = if result.is_ok() { FlowStatus::Completed } else { FlowStatus::Failed };
        let outcome = FlowOutcome { flow_id,
                                    status,
                                    error: result.as_ref().err().map(|e| e.to_string()),
                                    finished_at: Utc::now() };
        if let Err(e) = self.record_outcome(&outcome).await {
            error!("flow:finish not recorded party={} flow_id={flow_id} status={} error={e}",
                   self.inner.identity,
                   status.as_str());
            entry.set_status(FlowStatus::Suspended);
            rt.pending_result = Some(result);
            return;
        }
        rt.finished = true;

        self.expire_orphans();
        for session in rt.sessions.values() {
            let end = end_for(&result, session.id, rt.initiated_by);
            match &session.state {
                SessionState::Live { .. } => {
                    if let Some(m) = session.end_message(&end) {
                        rt.outbox.push(OutboundMessage::new(session.counterparty.clone(), m));
                    }
                }
                SessionState::Initiating { .. } => {
                    self.inner.orphans.insert(session.id,
                                              OrphanSession { session: session.clone(),
                                                              end,
                                                              since: Instant::now() });
                }
                _ => {}
            }
        }
        self.flush_outbox(rt).await;

        for id in rt.sessions.keys() {
            self.inner.session_index.remove(id);
        }
        self.inner.finished.insert(flow_id,
                                   FinishedFlow { routine: rt.root.clone(),
                                                  result: result.clone() });
        self.inner.flows.remove(&flow_id);
        entry.set_status(status);
        match &result {
            Ok(_) => {
                info!("flow:completed party={} flow_id={flow_id} routine={}", self.inner.identity, rt.root);
                self.record(flow_id, FlowEventKind::FlowCompleted);
            }
            Err(e) => {
                warn!("flow:failed party={} flow_id={flow_id} routine={} error={e}",
                      self.inner.identity,
                      rt.root);
                self.record(flow_id, FlowEventKind::FlowFailed { error: e.to_string() });
            }
        }
        let waiters = self.lock_waiters().remove(&flow_id).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        self.inner.live.send_modify(|n| *n = n.saturating_sub(1));
    }
}

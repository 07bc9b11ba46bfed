//! Estado en memoria de un flow vivo.
//!
//! `FlowEntry` es lo que comparten `deliver` y los workers: un buzón FIFO
//! (mutex síncrono, nunca retenido a través de un `.await`) y el token de
//! ejecución (mutex async) que protege `FlowRuntime`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use super::core::FlowResult;
use crate::checkpoint::{Checkpoint, FrameRecord, WaitCondition};
use crate::constants::CHECKPOINT_FORMAT_VERSION;
use crate::errors::CheckpointError;
use crate::model::{FlowId, FlowStatus, Party, SessionId};
use crate::protocol::{OutboundMessage, SessionMessage};
use crate::registry::ProtocolRegistry;
use crate::routine::FlowRoutine;
use crate::session::FlowSession;

/// Entrada pendiente en el buzón de un flow.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message { from: Party, message: SessionMessage },
    Signal { key: String, value: Value },
}

pub(crate) struct Frame {
    pub routine: Box<dyn FlowRoutine>,
    pub initiated: Vec<Party>,
}

impl Frame {
    pub fn new(routine: Box<dyn FlowRoutine>) -> Self {
        Self { routine,
               initiated: Vec::new() }
    }
}

pub(crate) struct FlowRuntime {
    /// Nombre del routine raíz (se conserva aunque la pila quede vacía).
    pub root: String,
    pub frames: Vec<Frame>,
    pub sessions: IndexMap<SessionId, FlowSession>,
    pub wait: Option<WaitCondition>,
    pub outbox: Vec<OutboundMessage>,
    pub signals: Vec<(String, Value)>,
    pub initiated_by: Option<SessionId>,
    pub sequence: u64,
    pub started: bool,
    pub finished: bool,
    /// Hay cambios aplicados desde el último checkpoint.
    pub dirty: bool,
    /// Resultado terminal que el store aún no aceptó.
    pub pending_result: Option<FlowResult>,
}

impl FlowRuntime {
    pub fn new(root: Box<dyn FlowRoutine>) -> Self {
        Self { root: root.routine_name().to_string(),
               frames: vec![Frame::new(root)],
               sessions: IndexMap::new(),
               wait: None,
               outbox: Vec::new(),
               signals: Vec::new(),
               initiated_by: None,
               sequence: 0,
               started: false,
               finished: false,
               dirty: false,
               pending_result: None }
    }

    /// Nombres de la pila, de la base a la cima.
    pub fn stack_names(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.routine.routine_name().to_string()).collect()
    }

    /// Toma el siguiente número de secuencia y construye el snapshot.
    pub fn snapshot(&mut self, flow_id: FlowId, status: FlowStatus) -> Result<Checkpoint, CheckpointError> {
        let mut frames = Vec::with_capacity(self.frames.len());
        for f in &self.frames {
            frames.push(FrameRecord { routine: f.routine.routine_name().to_string(),
                                      state: f.routine.save_state()?,
                                      initiated: f.initiated.clone() });
        }
        self.sequence += 1;
        Ok(Checkpoint { format_version: CHECKPOINT_FORMAT_VERSION,
                        flow_id,
                        sequence: self.sequence,
                        status,
                        frames,
                        sessions: self.sessions.values().cloned().collect(),
                        wait: self.wait.clone(),
                        outbox: self.outbox.clone(),
                        initiated_by: self.initiated_by,
                        signals: self.signals.clone(),
                        saved_at: Utc::now() })
    }

    /// Reconstruye el runtime desde un checkpoint. El outbox se conserva
    /// para reenviarse con los mismos `message_id`.
    pub fn from_checkpoint(checkpoint: Checkpoint, registry: &ProtocolRegistry) -> Result<Self, CheckpointError> {
        let mut frames = Vec::with_capacity(checkpoint.frames.len());
        for record in checkpoint.frames {
            let routine = registry.restore(&record.routine, record.state)?;
            frames.push(Frame { routine,
                                initiated: record.initiated });
        }
        let root = frames.first().map(|f| f.routine.routine_name().to_string()).unwrap_or_default();
        let sessions = checkpoint.sessions.into_iter().map(|s| (s.id, s)).collect();
        Ok(Self { root,
                  frames,
                  sessions,
                  started: checkpoint.wait.is_some(),
                  wait: checkpoint.wait,
                  outbox: checkpoint.outbox,
                  signals: checkpoint.signals,
                  initiated_by: checkpoint.initiated_by,
                  sequence: checkpoint.sequence,
                  finished: false,
                  dirty: false,
                  pending_result: None })
    }
}

pub(crate) struct FlowEntry {
    pub id: FlowId,
    mailbox: Mutex<VecDeque<Inbound>>,
    status: Mutex<FlowStatus>,
    /// Hay una reanudación programada que aún no tomó el buzón.
    queued: AtomicBool,
    pub runtime: AsyncMutex<FlowRuntime>,
}

impl FlowEntry {
    pub fn new(id: FlowId, runtime: FlowRuntime, status: FlowStatus) -> Self {
        Self { id,
               mailbox: Mutex::new(VecDeque::new()),
               status: Mutex::new(status),
               queued: AtomicBool::new(false),
               runtime: AsyncMutex::new(runtime) }
    }

    pub fn push(&self, inbound: Inbound) {
        self.mailbox.lock().unwrap_or_else(|e| e.into_inner()).push_back(inbound);
    }

    pub fn drain(&self) -> VecDeque<Inbound> {
        std::mem::take(&mut *self.mailbox.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Devuelve `true` si no había otra reanudación en cola.
    pub fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub fn status(&self) -> FlowStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: FlowStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlowCtx;
    use crate::errors::{CodecError, FlowError};
    use crate::routine::{Resume, Step};

    struct Idle;

    impl FlowRoutine for Idle {
        fn routine_name(&self) -> &str {
            "Idle"
        }

        fn resume(&mut self, _ctx: &mut FlowCtx<'_>, _input: Resume) -> Result<Step, FlowError> {
            Ok(Step::wait_external("never"))
        }

        fn save_state(&self) -> Result<Value, CodecError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn only_one_resumption_is_queued_per_flow() {
        let entry = FlowEntry::new(FlowId::new(), FlowRuntime::new(Box::new(Idle)), FlowStatus::Created);
        assert!(entry.mark_queued());
        assert!(!entry.mark_queued());
        entry.clear_queued();
        assert!(entry.mark_queued());
    }
}

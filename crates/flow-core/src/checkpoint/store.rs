use dashmap::DashMap;

use super::{FlowOutcome, SerializedCheckpoint};
use crate::errors::CheckpointError;
use crate::model::FlowId;

/// Almacenamiento durable de checkpoints, indexado por flow.
///
/// Contrato:
/// - `save` sobrescribe el checkpoint previo del flow.
/// - `finish` se invoca una vez al terminar el flow; debe eliminar el
///   checkpoint (y, si el backend lo soporta, registrar el resultado en la
///   misma transacción).
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, checkpoint: &SerializedCheckpoint) -> Result<(), CheckpointError>;
    fn load(&self, flow_id: FlowId) -> Result<Option<SerializedCheckpoint>, CheckpointError>;
    fn delete(&self, flow_id: FlowId) -> Result<(), CheckpointError>;
    /// Todos los checkpoints vigentes (para restaurar tras un reinicio).
    fn load_all(&self) -> Result<Vec<SerializedCheckpoint>, CheckpointError>;

    fn finish(&self, outcome: &FlowOutcome) -> Result<(), CheckpointError> {
        self.delete(outcome.flow_id)
    }
}

/// Store en memoria. Ignora escrituras con `sequence` no mayor a la vigente.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: DashMap<FlowId, SerializedCheckpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &SerializedCheckpoint) -> Result<(), CheckpointError> {
        let mut slot = self.inner.entry(checkpoint.flow_id).or_insert_with(|| checkpoint.clone());
        if slot.sequence < checkpoint.sequence {
            *slot = checkpoint.clone();
        }
        Ok(())
    }

    fn load(&self, flow_id: FlowId) -> Result<Option<SerializedCheckpoint>, CheckpointError> {
        Ok(self.inner.get(&flow_id).map(|c| c.value().clone()))
    }

    fn delete(&self, flow_id: FlowId) -> Result<(), CheckpointError> {
        self.inner.remove(&flow_id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SerializedCheckpoint>, CheckpointError> {
        let mut all: Vec<SerializedCheckpoint> = self.inner.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.flow_id);
        Ok(all)
    }
}

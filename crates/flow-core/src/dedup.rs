//! Caché acotada de identificadores de mensaje ya vistos.
//!
//! Evita reprocesar retransmisiones del transporte (at-least-once). Al
//! superar la capacidad se desaloja el identificador más antiguo, por lo que
//! un duplicado muy tardío puede no detectarse (falso negativo aceptado).

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::model::MessageId;

#[derive(Debug, Default)]
struct Seen {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

#[derive(Debug)]
pub struct DeduplicationCache {
    capacity: usize,
    seen: Mutex<Seen>,
}

impl DeduplicationCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1),
               seen: Mutex::new(Seen::default()) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Devuelve `false` (y registra el id) la primera vez; `true` mientras
    /// el id siga residente.
    pub fn check_duplicate(&self, id: MessageId) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.ids.contains(&id) {
            return true;
        }
        seen.ids.insert(id);
        seen.order.push_back(id);
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Resultados de flows terminados, acotados por capacidad.
//!
//! Se conservan para `result_of` / `status` de flows recién terminados. Al
//! superar la capacidad se descarta el resultado más antiguo; preguntar por
//! él después equivale a preguntar por un flow desconocido.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::core::FlowResult;
use crate::model::FlowId;

pub(super) struct FinishedFlow {
    pub routine: String,
    pub result: FlowResult,
}

#[derive(Default)]
struct Retained {
    by_id: HashMap<FlowId, FinishedFlow>,
    order: VecDeque<FlowId>,
}

pub(super) struct FinishedFlows {
    capacity: usize,
    retained: Mutex<Retained>,
}

impl FinishedFlows {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1),
               retained: Mutex::new(Retained::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Retained> {
        self.retained.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, flow_id: FlowId, finished: FinishedFlow) {
        let mut retained = self.lock();
        if retained.by_id.insert(flow_id, finished).is_none() {
            retained.order.push_back(flow_id);
        }
        while retained.order.len() > self.capacity {
            if let Some(oldest) = retained.order.pop_front() {
                retained.by_id.remove(&oldest);
            }
        }
    }

    pub fn result(&self, flow_id: FlowId) -> Option<FlowResult> {
        self.lock().by_id.get(&flow_id).map(|f| f.result.clone())
    }

    /// Resultados cuyo routine raíz es `routine`, en orden de terminación.
    pub fn results_for(&self, routine: &str) -> Vec<FlowResult> {
        let retained = self.lock();
        retained.order
                .iter()
                .filter_map(|id| retained.by_id.get(id))
                .filter(|f| f.routine == routine)
                .map(|f| f.result.clone())
                .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn done(n: i64) -> FinishedFlow {
        FinishedFlow { routine: "Counter".into(),
                       result: Ok(json!(n)) }
    }

    #[test]
    fn oldest_result_is_dropped_beyond_capacity() {
        let finished = FinishedFlows::new(2);
        let ids: Vec<FlowId> = (0..3).map(|_| FlowId::new()).collect();
        for (n, id) in ids.iter().enumerate() {
            finished.insert(*id, done(n as i64));
        }
        assert_eq!(finished.len(), 2);
        assert!(finished.result(ids[0]).is_none());
        assert_eq!(finished.result(ids[2]).unwrap().unwrap(), json!(2));
        let values: Vec<_> = finished.results_for("Counter").into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![json!(1), json!(2)]);
    }
}

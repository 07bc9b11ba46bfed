
use std::sync::Arc;

use async_trait::async_trait;
use flow_core::{to_state, CodecError, Envelope, FlowCtx, FlowError, FlowOrchestrator, FlowRoutine, Party,
                ProtocolRegistry, Resume, Step, Transport, TransportError};
use flow_persistence::{PgCheckpointStore, PoolProvider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use test_support::{skip, TEST_POOL};

struct SilentTransport;

#[async_trait]
impl Transport for SilentTransport {
    async fn send(&self, _envelope: Envelope) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Espera la señal "go" y devuelve cuántas veces arrancó.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ParkedFlow {
    starts: u32,
}

impl FlowRoutine for ParkedFlow {
    fn routine_name(&self) -> &str {
        "ParkedFlow"
    }

    fn resume(&mut self, _ctx: &mut FlowCtx<'_>, input: Resume) -> Result<Step, FlowError> {
        match input {
            Resume::Start => {
                self.starts += 1;
                Ok(Step::wait_external("go"))
            }
            _ => Step::done(&self.starts),
        }
    }

    fn save_state(&self) -> Result<Value, CodecError> {
        to_state(self)
    }
}

fn node(pool: &flow_persistence::PgPool) -> FlowOrchestrator {
    let registry = ProtocolRegistry::new();
    registry.register_routine::<ParkedFlow>("ParkedFlow");
    FlowOrchestrator::builder(Party::new("Alice")).transport(Arc::new(SilentTransport))
                                                  .registry(Arc::new(registry))
                                                  .checkpoint_store(Arc::new(PgCheckpointStore::new(PoolProvider { pool: pool.clone() })))
                                                  .build()
}

#[tokio::test]
async fn parked_flow_survives_a_new_orchestrator() {
    let Some(pool) = TEST_POOL.as_ref() else {
        skip("parked_flow_survives_a_new_orchestrator");
        return;
    };

    let first = node(pool);
    let handle = first.start(ParkedFlow::default()).expect("start");
    let flow_id = handle.id;
    first.flush().await;
    drop(first);

    let second = node(pool);
    second.restore().expect("restore");
    assert!(second.live_flows().contains(&flow_id));

    second.signal(flow_id, "go", Value::Null).expect("signal");
    let starts: u32 = second.result_of(flow_id).expect("handle").result_as().await.expect("result");
    assert_eq!(starts, 1);

    let store = PgCheckpointStore::new(PoolProvider { pool: pool.clone() });
    assert!(flow_core::CheckpointStore::load(&store, flow_id).expect("load").is_none());
    assert!(store.outcome(flow_id).expect("outcome").is_some());
}

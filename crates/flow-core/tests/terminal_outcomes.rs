
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flow_core::testing::{InMemoryNetwork, SessionTransfer, TransferEvent};
use flow_core::{to_state, CheckpointError, CheckpointStore, CodecError, EngineConfig, FlowCtx, FlowError, FlowId,
                FlowOutcome, FlowRoutine, FlowStatus, InMemoryCheckpointStore, Party, ProtocolDecl, Resume,
                SerializedCheckpoint, Step};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use test_flows::*;

/// Store en memoria con fallos programables.
struct FlakyStore {
    inner: Arc<InMemoryCheckpointStore>,
    /// Escrituras que aún se aceptan.
    saves_left: AtomicUsize,
    /// Llamadas a `finish` que todavía fallan.
    finish_failures: AtomicUsize,
    finish_calls: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryCheckpointStore>) -> Self {
        Self { inner,
               saves_left: AtomicUsize::new(usize::MAX),
               finish_failures: AtomicUsize::new(0),
               finish_calls: AtomicUsize::new(0) }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl CheckpointStore for FlakyStore {
    fn save(&self, checkpoint: &SerializedCheckpoint) -> Result<(), CheckpointError> {
        if !take_one(&self.saves_left) {
            return Err(CheckpointError::Backend("disk full".into()));
        }
        self.inner.save(checkpoint)
    }

    fn load(&self, flow_id: FlowId) -> Result<Option<SerializedCheckpoint>, CheckpointError> {
        self.inner.load(flow_id)
    }

    fn delete(&self, flow_id: FlowId) -> Result<(), CheckpointError> {
        self.inner.delete(flow_id)
    }

    fn load_all(&self) -> Result<Vec<SerializedCheckpoint>, CheckpointError> {
        self.inner.load_all()
    }

    fn finish(&self, outcome: &FlowOutcome) -> Result<(), CheckpointError> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.finish_failures) {
            return Err(CheckpointError::Backend("db down".into()));
        }
        self.inner.finish(outcome)
    }
}

/// Crea `name` sobre un `FlakyStore` y lo devuelve junto al nodo.
fn flaky_node(net: &InMemoryNetwork,
              name: &str,
              config: EngineConfig)
              -> (flow_core::FlowOrchestrator, Arc<FlakyStore>) {
    let mut flaky = None;
    let node = net.create_node_with_store(name, known_routines(), config, |store| {
                      let s = Arc::new(FlakyStore::new(store));
                      flaky = Some(s.clone());
                      s as Arc<dyn CheckpointStore>
                  });
    (node, flaky.expect("store wrapped"))
}

/// Abre sesión, envía un saludo y termina sin esperar respuesta.
#[derive(Debug, Serialize, Deserialize)]
struct FireAndForgetFlow {
    other_party: Party,
}

impl FlowRoutine for FireAndForgetFlow {
    fn routine_name(&self) -> &str {
        "FireAndForgetFlow"
    }

    fn initiating(&self) -> Option<ProtocolDecl> {
        Some(ProtocolDecl::new("FireAndForgetFlow", 1))
    }

    fn resume(&mut self, ctx: &mut FlowCtx<'_>, _input: Resume) -> Result<Step, FlowError> {
        let session = ctx.initiate_flow(&self.other_party)?;
        ctx.send(session, &"hi".to_string())?;
        Step::done(&true)
    }

    fn save_state(&self) -> Result<Value, CodecError> {
        to_state(self)
    }
}

#[tokio::test]
async fn unrecorded_finish_keeps_the_flow_parked_with_its_checkpoint() {
    let net = InMemoryNetwork::new();
    let (alice, flaky) = flaky_node(&net, "Alice", EngineConfig::default().with_app_name("Alice"));
    flaky.finish_failures.store(usize::MAX, Ordering::SeqCst);

    let handle = alice.start(NoOpFlow::default()).expect("start");
    let flow_id = handle.id;
    alice.flush().await;

    // Ni resultado publicado ni checkpoint borrado
    let pending = tokio::time::timeout(Duration::from_millis(50), handle.result()).await;
    assert!(pending.is_err(), "result must not be published");
    assert_eq!(flaky.finish_calls.load(Ordering::SeqCst), 4);
    assert_eq!(net.checkpoint_store(alice.identity()).expect("store").len(), 1);
    assert_eq!(alice.live_flows(), vec![flow_id]);
    assert_eq!(alice.status(flow_id), Some(FlowStatus::Suspended));
    assert_eq!(alice.event_variants(flow_id), vec!["S", "K"]);
    assert_eq!(alice.finished_count(), 0);

    // Con el store sano, la siguiente reanudación cierra el flow
    flaky.finish_failures.store(0, Ordering::SeqCst);
    let handle = alice.result_of(flow_id).expect("still live");
    alice.signal(flow_id, "retry", Value::Null).expect("signal");
    let started: bool = handle.result_as().await.expect("result");
    assert!(started);
    assert!(net.checkpoint_store(alice.identity()).expect("store").is_empty());
    assert_eq!(alice.event_variants(flow_id), vec!["S", "K", "C"]);
    assert!(alice.live_flows().is_empty());
}

#[tokio::test]
async fn unrecorded_finish_sends_no_session_end() {
    let net = InMemoryNetwork::new();
    let (alice, flaky) = flaky_node(&net, "Alice", EngineConfig::default().with_app_name("Alice"));
    let bob_registry = known_routines();
    bob_registry.register("PingPongFlow", 1, |s| Box::new(PingPongFlow::initiated(s, 20)));
    let bob = net.create_node("Bob", bob_registry);
    flaky.finish_failures.store(usize::MAX, Ordering::SeqCst);

    let handle = alice.start(PingPongFlow::new(bob.identity().clone(), 10)).expect("start");
    let flow_id = handle.id;
    net.run_network().await;

    assert_eq!(alice.live_flows(), vec![flow_id]);
    let ends_to_bob = net.transfers()
                         .into_iter()
                         .filter(|t| &t.from == alice.identity())
                         .filter(|t| matches!(t.event, TransferEvent::NormalEnd | TransferEvent::ErrorEnd(_)))
                         .count();
    assert_eq!(ends_to_bob, 0);
    assert_eq!(net.checkpoint_store(alice.identity()).expect("store").len(), 1);
}

#[tokio::test]
async fn finish_is_retried_on_transient_failures() {
    let net = InMemoryNetwork::new();
    let (alice, flaky) = flaky_node(&net, "Alice", EngineConfig::default().with_app_name("Alice"));
    flaky.finish_failures.store(2, Ordering::SeqCst);

    let handle = alice.start(NoOpFlow::default()).expect("start");
    let started: bool = handle.result_as().await.expect("result");

    assert!(started);
    assert_eq!(flaky.finish_calls.load(Ordering::SeqCst), 3);
    assert!(net.checkpoint_store(alice.identity()).expect("store").is_empty());
    assert!(alice.live_flows().is_empty());
}

#[tokio::test]
async fn checkpoint_write_failure_ends_flow_with_internal_error() {
    let net = InMemoryNetwork::new();
    let (alice, flaky) = flaky_node(&net, "Alice", EngineConfig::default().with_app_name("Alice"));
    let bob_registry = known_routines();
    bob_registry.register("PingPongFlow", 1, |s| Box::new(PingPongFlow::initiated(s, 20)));
    let bob = net.create_node("Bob", bob_registry);
    let (a, b) = (alice.identity().clone(), bob.identity().clone());
    // Checkpoint inicial y el de la primera suspensión; el siguiente falla
    flaky.saves_left.store(2, Ordering::SeqCst);

    let handle = alice.start(PingPongFlow::new(b.clone(), 10)).expect("start");
    net.run_network().await;

    let err = handle.result().await.expect_err("checkpoint failure");
    assert!(matches!(err, FlowError::Internal(_)), "got {err:?}");
    assert!(err.message().contains("checkpoint failed"), "{}", err.message());
    assert!(err.message().contains("disk full"), "{}", err.message());
    assert!(alice.live_flows().is_empty());
    assert!(net.checkpoint_store(&a).expect("store").is_empty());

    let from_alice: Vec<SessionTransfer> = net.transfers().into_iter().filter(|t| t.from == a).collect();
    assert_eq!(from_alice,
               vec![SessionTransfer::new(&a,
                                         &b,
                                         TransferEvent::Init { protocol: "PingPongFlow".into(),
                                                               version: 1,
                                                               payload: Some(json!(10)) }),
                    SessionTransfer::new(&a, &b, TransferEvent::ErrorEnd(None))]);

    // El responder ve un fin inesperado
    let bob_results = bob.finished_results("PingPongFlow");
    assert_eq!(bob_results.len(), 1);
    assert!(matches!(bob_results[0], Err(FlowError::UnexpectedEnd { .. })), "got {:?}", bob_results[0]);
    assert!(bob.live_flows().is_empty());
}

#[tokio::test]
async fn finished_results_are_retained_up_to_capacity() {
    let net = InMemoryNetwork::new();
    let config = EngineConfig::default().with_app_name("Alice").with_finished_capacity(10);
    let alice = net.create_node_with_config("Alice", known_routines(), config);

    let mut ids = Vec::new();
    for _ in 0..25 {
        let handle = alice.start(NoOpFlow::default()).expect("start");
        ids.push(handle.id);
        handle.result().await.expect("result");
    }

    assert_eq!(alice.finished_count(), 10);
    assert_eq!(alice.finished_results("NoOpFlow").len(), 10);
    assert!(alice.result_of(ids[0]).is_none());
    assert_eq!(alice.status(ids[14]), None);
    assert_eq!(alice.status(ids[15]), Some(FlowStatus::Completed));
    let last = alice.result_of(ids[24]).expect("recent flow");
    assert_eq!(last.result().await.expect("result"), json!(true));
    assert!(alice.live_flows().is_empty());
}

#[tokio::test]
async fn unconfirmed_orphan_sessions_expire() {
    let net = InMemoryNetwork::new();
    let config = EngineConfig::default().with_app_name("Alice")
                                        .with_orphan_timeout(Duration::from_millis(50));
    let alice = net.create_node_with_config("Alice", known_routines(), config);

    // Bob no existe: el SessionConfirm nunca llega
    let handle = alice.start(FireAndForgetFlow { other_party: Party::new("Bob") })
                      .expect("start");
    let sent: bool = handle.result_as().await.expect("result");
    assert!(sent);
    assert_eq!(alice.orphan_count(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    alice.start(NoOpFlow::default()).expect("start").result().await.expect("result");
    assert_eq!(alice.orphan_count(), 0);
}

#[tokio::test]
async fn orphan_within_timeout_is_still_closed_on_confirm() {
    let net = InMemoryNetwork::new();
    let alice = net.create_node("Alice", known_routines());
    let bob_registry = known_routines();
    bob_registry.register("FireAndForgetFlow", 1, |s| Box::new(InitiatedReceiveFlow::new(s)));
    let bob = net.create_node("Bob", bob_registry);

    let handle = alice.start(FireAndForgetFlow { other_party: bob.identity().clone() })
                      .expect("start");
    alice.flush().await;
    assert_eq!(alice.orphan_count(), 1);
    net.run_network().await;

    handle.result().await.expect("result");
    assert_eq!(alice.orphan_count(), 0);
    let (a, b) = (alice.identity().clone(), bob.identity().clone());
    let from_alice: Vec<SessionTransfer> = net.transfers().into_iter().filter(|t| t.from == a).collect();
    assert_eq!(from_alice,
               vec![SessionTransfer::new(&a,
                                         &b,
                                         TransferEvent::Init { protocol: "FireAndForgetFlow".into(),
                                                               version: 1,
                                                               payload: Some(json!("hi")) }),
                    SessionTransfer::new(&a, &b, TransferEvent::NormalEnd)]);
    let received: Vec<Value> = bob.finished_results("InitiatedReceiveFlow")
                                  .into_iter()
                                  .map(|r| r.expect("bob result"))
                                  .collect();
    assert_eq!(received, vec![json!(["hi"])]);
}

#[tokio::test]
async fn stopping_node_rejects_incoming_session_init() {
    let net = InMemoryNetwork::new();
    let alice = net.create_node("Alice", known_routines());
    let bob_registry = known_routines();
    bob_registry.register("PingPongFlow", 1, |s| Box::new(PingPongFlow::initiated(s, 20)));
    let bob = net.create_node("Bob", bob_registry);
    bob.stop().await;

    let handle = alice.start(PingPongFlow::new(bob.identity().clone(), 10)).expect("start");
    net.run_network().await;

    let err = handle.result().await.expect_err("rejected");
    assert!(matches!(err, FlowError::UnexpectedEnd { .. }), "got {err:?}");
    assert!(err.message().ends_with("Bob is stopping and accepts no new flows"), "{}", err.message());
    assert!(bob.live_flows().is_empty());
    assert_eq!(bob.finished_count(), 0);
}

#[tokio::test]
async fn signal_burst_on_one_flow_does_not_starve_others() {
    let net = InMemoryNetwork::new();
    let mut config = EngineConfig::default().with_app_name("Alice");
    config.max_workers = 1;
    let alice = net.create_node_with_config("Alice", known_routines(), config);

    let parked = alice.start(NoOpFlow::non_terminating()).expect("start");
    alice.flush().await;
    for n in 0..200 {
        alice.signal(parked.id, "noise", json!(n)).expect("signal");
    }
    let quick = alice.start(NoOpFlow::default()).expect("start");
    let done = tokio::time::timeout(Duration::from_secs(5), quick.result()).await
                                                                          .expect("not starved");
    assert_eq!(done.expect("result"), json!(true));

    alice.signal(parked.id, RELEASE, Value::Null).expect("signal");
    parked.result().await.expect("parked result");
    assert!(alice.live_flows().is_empty());
}


use flow_core::testing::{InMemoryNetwork, TransferEvent};
use flow_core::{CheckpointStore, EngineConfig, FlowInfo, FlowStatus, JsonCodec};
use serde_json::{json, Value};
use test_flows::*;

fn parked_config(name: &str) -> EngineConfig {
    EngineConfig::default().with_app_name(name).with_acceptable_live_on_stop(1)
}

#[tokio::test]
async fn newly_added_flow_is_preserved_on_restart() {
    let net = InMemoryNetwork::new();
    let alice = net.create_node_with_config("Alice", known_routines(), parked_config("Alice"));
    let handle = alice.start(NoOpFlow::non_terminating()).expect("start");
    let flow_id = handle.id;
    alice.flush().await;
    alice.stop().await;
    net.crash(alice.identity());

    let alice = net.restart(alice.identity()).expect("restart");
    assert_eq!(alice.live_flows(), vec![flow_id]);
    assert_eq!(alice.status(flow_id), Some(FlowStatus::Suspended));
    assert_eq!(alice.event_variants(flow_id), vec!["R"]);

    // El estado local del routine sobrevivió al reinicio
    alice.signal(flow_id, RELEASE, Value::Null).expect("signal");
    let started: bool = alice.result_of(flow_id).expect("handle").result_as().await.expect("result");
    assert!(started);
}

#[tokio::test]
async fn flow_restarted_just_after_receiving_payload() {
    let net = InMemoryNetwork::new();
    let alice = net.create_node("Alice", known_routines());
    let bob_registry = known_routines();
    bob_registry.register("SendFlow", 1, |s| Box::new(InitiatedReceiveFlow::new(s).non_terminating()));
    let bob = net.create_node_with_config("Bob", bob_registry, parked_config("Bob"));
    let b = bob.identity().clone();

    let handle = alice.start(SendFlow::new("Hello", vec![b.clone()])).expect("start");
    alice.flush().await;
    // Solo lo justo para que Bob reciba el payload
    assert!(net.pump_receive(&b).await);
    bob.stop().await;
    net.crash(&b);
    net.run_network().await;

    // Alice terminó; su fin de sesión quedó en cola para Bob
    let info: FlowInfo = handle.result_as().await.expect("alice result");
    assert_eq!(info.flow_version, 1);
    assert_eq!(net.pending_for(&b), 1);

    let bob = net.restart(&b).expect("restart");
    let restored = bob.live_flows();
    assert_eq!(restored.len(), 1);
    net.run_network().await;

    bob.signal(restored[0], RELEASE, Value::Null).expect("signal");
    let received: Vec<String> = bob.result_of(restored[0]).expect("handle").result_as().await.expect("bob result");
    assert_eq!(received, vec!["Hello".to_string()]);
}

#[tokio::test]
async fn flow_loaded_from_checkpoint_responds_to_messages_from_before_start() {
    let net = InMemoryNetwork::new();
    let alice_registry = known_routines();
    alice_registry.register("ReceiveFlow", 1, |s| Box::new(InitiatedSendFlow::new("Hello", s)));
    let alice = net.create_node("Alice", alice_registry);
    let bob = net.create_node_with_config("Bob", known_routines(), parked_config("Bob"));
    let b = bob.identity().clone();

    let handle = bob.start(ReceiveFlow::new(vec![alice.identity().clone()]).non_terminating())
                    .expect("start");
    let flow_id = handle.id;
    bob.flush().await;
    net.crash(&b);

    let bob = net.restart(&b).expect("restart");
    net.run_network().await;

    // El init se reenvió con el mismo id tras el reinicio: Alice lo ve dos
    // veces pero solo crea un flow
    let inits = net.transfers()
                   .into_iter()
                   .filter(|t| t.to == *alice.identity() && matches!(t.event, TransferEvent::Init { .. }))
                   .count();
    assert_eq!(inits, 2);
    assert_eq!(alice.finished_count(), 1);

    bob.signal(flow_id, RELEASE, Value::Null).expect("signal");
    let received: Vec<String> = bob.result_of(flow_id).expect("handle").result_as().await.expect("bob result");
    assert_eq!(received, vec!["Hello".to_string()]);
}

#[tokio::test]
async fn restart_resumption_matches_uninterrupted_run() {
    async fn run(interrupted: bool) -> (Value, Value) {
        let net = InMemoryNetwork::new();
        let alice = net.create_node("Alice", known_routines());
        let bob_registry = known_routines();
        bob_registry.register("PingPongFlow", 1, |s| Box::new(PingPongFlow::initiated(s, 20)));
        let bob = net.create_node("Bob", bob_registry);
        let a = alice.identity().clone();

        let handle = alice.start(PingPongFlow::new(bob.identity().clone(), 10)).expect("start");
        let flow_id = handle.id;
        let alice = if interrupted {
            // Alice queda aparcada en `receive` con su checkpoint escrito
            alice.flush().await;
            assert_eq!(net.checkpoint_store(&a).expect("store").len(), 1);
            net.crash(&a);
            net.run_network().await;
            net.restart(&a).expect("restart")
        } else {
            alice
        };
        net.run_network().await;

        let alice_result = alice.result_of(flow_id).expect("handle").result().await.expect("alice result");
        let bob_result = bob.finished_results("PingPongFlow")
                            .pop()
                            .expect("bob finished")
                            .expect("bob result");
        assert!(net.checkpoint_store(&a).expect("store").is_empty());
        (alice_result, bob_result)
    }

    let uninterrupted = run(false).await;
    let interrupted = run(true).await;
    assert_eq!(uninterrupted, (json!([20, 21]), json!([10, 11])));
    assert_eq!(interrupted, uninterrupted);
}

#[tokio::test]
async fn tampered_checkpoint_is_skipped_on_restore() {
    let net = InMemoryNetwork::new();
    let alice = net.create_node_with_config("Alice", known_routines(), parked_config("Alice"));
    let a = alice.identity().clone();
    let handle = alice.start(NoOpFlow::non_terminating()).expect("start");
    alice.flush().await;
    net.crash(&a);

    let store = net.checkpoint_store(&a).expect("store");
    let mut sealed = store.load(handle.id).expect("load").expect("checkpoint");
    // Antes de manipularlo, abre y conserva la pila de frames
    let checkpoint = sealed.open(&JsonCodec).expect("open");
    assert_eq!(checkpoint.frames[0].routine, "NoOpFlow");
    assert_eq!(checkpoint.frames[0].state["started"], json!(true));

    sealed.sequence += 1;
    sealed.fingerprint = "bogus".into();
    store.save(&sealed).expect("save");

    let alice = net.restart(&a).expect("restart");
    assert!(alice.live_flows().is_empty());
    // Se deja en el store para inspección
    assert_eq!(store.len(), 1);
}

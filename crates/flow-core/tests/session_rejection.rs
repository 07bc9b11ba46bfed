
use flow_core::testing::{InMemoryNetwork, SessionTransfer, TransferEvent};
use flow_core::{FlowError, Party, ProtocolRegistry, SessionId, SessionMessage};
use test_flows::*;

fn raw_init(protocol_name: &str) -> SessionMessage {
    SessionMessage::SessionInit { initiator_session_id: SessionId::new(),
                                  protocol_name: protocol_name.to_string(),
                                  protocol_version: 1,
                                  app_identifier: "version".to_string(),
                                  first_payload: None }
}

#[tokio::test]
async fn unregistered_flow_is_rejected_with_reason() {
    let net = InMemoryNetwork::new();
    let alice = net.create_node("Alice", known_routines());
    // Bob conoce el routine pero no tiene responder para el protocolo
    let bob = net.create_node("Bob", known_routines());
    let (a, b) = (alice.identity().clone(), bob.identity().clone());

    let handle = alice.start(ReceiveFlow::new(vec![b.clone()])).expect("start");
    net.run_network().await;

    let err = handle.result().await.expect_err("should fail");
    assert!(matches!(err, FlowError::UnexpectedEnd { .. }), "got {err:?}");
    let message = err.message();
    assert!(message.starts_with("String was expected from Bob"), "{message}");
    assert!(message.ends_with("ReceiveFlow is not registered"), "{message}");

    assert_eq!(net.transfers(),
               vec![SessionTransfer::new(&a,
                                         &b,
                                         TransferEvent::Init { protocol: "ReceiveFlow".into(),
                                                               version: 1,
                                                               payload: None }),
                    SessionTransfer::new(&b,
                                         &a,
                                         TransferEvent::Reject { reason: "ReceiveFlow is not registered".into() })]);
    assert!(bob.live_flows().is_empty());
    assert_eq!(bob.finished_count(), 0);
}

#[tokio::test]
async fn unknown_class_in_session_init() {
    let net = InMemoryNetwork::new();
    net.create_node("Alice", ProtocolRegistry::new());
    let bob = net.create_node("Bob", known_routines());
    let (a, b) = (Party::new("Alice"), Party::new("Bob"));

    net.send_raw(&a, &b, &raw_init("not.a.real.Class")).expect("send raw");
    net.run_network().await;

    // Solo el init y el reject
    let transfers = net.transfers();
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[1].event,
               TransferEvent::Reject { reason: "Don't know not.a.real.Class".into() });
    assert!(bob.live_flows().is_empty());
    assert_eq!(bob.finished_count(), 0);
    assert!(net.checkpoint_store(&b).expect("store").is_empty());
}

#[tokio::test]
async fn non_flow_class_in_session_init() {
    let net = InMemoryNetwork::new();
    net.create_node("Alice", ProtocolRegistry::new());
    let registry = known_routines();
    let string_type = "String";
    registry.register_data_type(string_type);
    let bob = net.create_node("Bob", registry);
    let (a, b) = (Party::new("Alice"), Party::new("Bob"));

    net.send_raw(&a, &b, &raw_init(string_type)).expect("send raw");
    net.run_network().await;

    let transfers = net.transfers();
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[1].event,
               TransferEvent::Reject { reason: format!("{string_type} is not a flow") });
    assert!(bob.live_flows().is_empty());
}

#[tokio::test]
async fn rejected_counterparty_info_fails_the_waiting_flow() {
    let net = InMemoryNetwork::new();
    let alice = net.create_node("Alice", known_routines());
    let bob = net.create_node("Bob", ProtocolRegistry::new());

    let handle = alice.start(SendFlow::new("Hello", vec![bob.identity().clone()])).expect("start");
    net.run_network().await;

    let err = handle.result().await.expect_err("should fail");
    assert!(err.message().ends_with("Don't know SendFlow"), "{}", err.message());
    assert!(net.checkpoint_store(alice.identity()).expect("store").is_empty());
}

use flowmesh::core::testing::InMemoryNetwork;
use flowmesh::core::FlowError;
use flowmesh::demo::{demo_registry, run_squares, SquaresFlow};

#[test]
fn squares_over_the_in_memory_network() {
    let report = tokio_test::block_on(run_squares(vec![3, -4, 5])).expect("demo");
    assert_eq!(report.squares, vec![9, 16, 25]);
    assert_eq!(report.served, 3);
    // init, confirm, 3 valores, 3 cuadrados y un fin por lado
    assert_eq!(report.transfers, 10);
}

#[test]
fn no_values_still_closes_both_sides() {
    let report = tokio_test::block_on(run_squares(Vec::new())).expect("demo");
    assert!(report.squares.is_empty());
    assert_eq!(report.served, 0);
}

#[tokio::test]
async fn overflow_is_a_declared_error_seen_by_the_client() {
    let net = InMemoryNetwork::new();
    let client = net.create_node("Client", demo_registry());
    let server = net.create_node("Server", demo_registry());

    let handle = client.start(SquaresFlow::new(server.identity().clone(), vec![2, i64::MAX]))
                       .expect("start");
    net.run_network().await;

    let err = handle.result().await.expect_err("overflow");
    let FlowError::Application(app) = &err else {
        panic!("expected declared error, got {err:?}");
    };
    assert_eq!(app.kind, "Overflow");
    assert!(app.trace.iter().all(|frame| frame == "SquaresFlow"), "{:?}", app.trace);
}

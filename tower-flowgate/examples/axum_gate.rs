use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use flowgate::FlowGate;
use tower::BoxError;
use tower::ServiceBuilder;
use tower_flowgate::FlowGateLayer;
use tower_flowgate::GateError;

#[tokio::main]
async fn main() {
    // 1. Setup the engine: 10 requests per second per path, the rest paced
    //    into a queue of at most half a second.
    let gate = FlowGate::new(Default::default()).unwrap();
    gate.load_rules_json(
        r#"[
            {"resource": "/", "threshold": 10, "controlBehavior": 1, "maxQueueingTimeMs": 500},
            {"resource": "/burst", "threshold": 10}
        ]"#,
    )
    .unwrap();

    // 2. Setup the layer, one resource per path
    let layer =
        FlowGateLayer::with_extractor(gate, |req: &Request| req.uri().path().to_string());

    // 3. Build the Router
    let app = Router::new()
        .route("/", get(|| async { "Hello, Flowgate!" }))
        .route("/burst", get(|| async { "Hello, Burst!" }))
        .layer(
            ServiceBuilder::new()
                // 1. The outermost layer: catches BoxError and returns Response
                .layer(HandleErrorLayer::new(handle_gate_error))
                // 2. Boxes GateError
                .map_err(BoxError::from)
                // 3. The gate itself
                .layer(layer),
        );

    // 4. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .unwrap();
    println!("📡 Listening on http://127.0.0.1:3000");

    axum::serve(listener, app).await.unwrap();
}

/// The signature must match BoxError -> IntoResponse
async fn handle_gate_error(err: BoxError) -> impl IntoResponse {
    match err.downcast::<GateError>() {
        Ok(gate_err) => (*gate_err).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response(),
    }
}

use super::*;
use std::time::Duration;

use axum::{body, body::Body, http::Request};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::protocol::{RenderFrame, CALL_FUNC, MESSAGE_ACK, UPDATE_MODEL};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

use crate::config::Settings;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn demo_state() -> AppState {
    AppState::with_demo(&Settings::default()).expect("demo widgets")
}

async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(Arc::new(state));
    tokio::spawn(async move { axum::serve(listener, app).await.expect("serve") });
    addr
}

async fn connect(addr: SocketAddr, widget: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/widgets/{widget}/ws"))
        .await
        .expect("connect");
    socket
}

async fn next_frame(socket: &mut Socket) -> RenderFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("websocket message");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).expect("render frame");
        }
    }
}

/// Reads frames until `done` accepts one.
async fn frame_where(socket: &mut Socket, done: impl Fn(&RenderFrame) -> bool) -> RenderFrame {
    loop {
        let frame = next_frame(socket).await;
        if done(&frame) {
            return frame;
        }
    }
}

async fn send_event(socket: &mut Socket, kind: &str, payload: Value, frame: &RenderFrame) {
    let event = json!([kind, payload, frame.wrapper_props.client_id]);
    socket
        .send(WsMessage::Text(event.to_string()))
        .await
        .expect("send");
}

fn counter_of(frame: &RenderFrame) -> Value {
    frame.wrapper_props.model["state"]["counter"].clone()
}

fn returned(frame: &RenderFrame, return_id: &str) -> Option<Value> {
    frame
        .wrapper_props
        .messages
        .iter()
        .find(|m| m.kind == return_id)
        .map(|m| m.payload.clone())
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = build_router(Arc::new(demo_state()));
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn widgets_route_lists_hosted_names() {
    let app = build_router(Arc::new(demo_state()));
    let request = Request::get("/widgets")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let names: Vec<String> = serde_json::from_slice(&body).expect("json");
    assert_eq!(names, vec!["counter", "counter_history"]);
}

#[tokio::test]
async fn unknown_widget_is_not_found() {
    let app = build_router(Arc::new(demo_state()));
    let request = Request::get("/widgets/nope/ws")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let error: ApiError = serde_json::from_slice(&body).expect("json");
    assert_eq!(error.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn plain_get_on_websocket_route_is_rejected() {
    let app = build_router(Arc::new(demo_state()));
    let request = Request::get("/widgets/counter/ws")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn websocket_client_calls_functions_and_actions() {
    let addr = serve(demo_state()).await;
    let mut socket = connect(addr, "counter").await;

    let first = next_frame(&mut socket).await;
    assert_eq!(counter_of(&first), json!(0));
    assert_eq!(first.component_props, json!({ "title": "Counter" }));
    assert_eq!(
        first.wrapper_props.model["actions"]["inc"],
        json!({ "type": "function" })
    );

    send_event(
        &mut socket,
        CALL_FUNC,
        json!({ "key": "add", "returnId": "r-add", "args": [2, 3] }),
        &first,
    )
    .await;
    let frame = frame_where(&mut socket, |f| returned(f, "r-add").is_some()).await;
    assert_eq!(returned(&frame, "r-add"), Some(json!([5, null])));

    send_event(
        &mut socket,
        CALL_FUNC,
        json!({ "path": ["actions", "inc"], "returnId": "r-inc", "args": [4] }),
        &first,
    )
    .await;
    let frame = frame_where(&mut socket, |f| returned(f, "r-inc").is_some()).await;
    assert_eq!(returned(&frame, "r-inc"), Some(json!([null, null])));
    assert_eq!(counter_of(&frame), json!(4));

    send_event(
        &mut socket,
        CALL_FUNC,
        json!({ "key": "foo", "returnId": "r-foo" }),
        &first,
    )
    .await;
    let frame = frame_where(&mut socket, |f| returned(f, "r-foo").is_some()).await;
    assert_eq!(
        returned(&frame, "r-foo"),
        Some(json!([null, "function not found"]))
    );

    // Acked messages are no longer redelivered.
    for message in frame.wrapper_props.messages.clone() {
        send_event(&mut socket, MESSAGE_ACK, json!(message.id), &frame).await;
    }
    send_event(
        &mut socket,
        CALL_FUNC,
        json!({ "key": "add", "returnId": "r-last", "args": [1, 1] }),
        &first,
    )
    .await;
    let frame = frame_where(&mut socket, |f| returned(f, "r-last").is_some()).await;
    assert_eq!(frame.wrapper_props.messages.len(), 1);
}

#[tokio::test]
async fn model_updates_reach_other_clients() {
    let addr = serve(demo_state()).await;
    let mut alice = connect(addr, "counter").await;
    let mut bob = connect(addr, "counter").await;
    let alice_first = next_frame(&mut alice).await;
    next_frame(&mut bob).await;

    send_event(
        &mut alice,
        UPDATE_MODEL,
        json!({ "path": ["state", "counter"], "value": 5 }),
        &alice_first,
    )
    .await;

    let frame = frame_where(&mut bob, |f| counter_of(f) == json!(5)).await;
    assert_ne!(frame.wrapper_props.client_id, alice_first.wrapper_props.client_id);
}

#[tokio::test]
async fn history_view_mirrors_recorded_actions() {
    let addr = serve(demo_state()).await;
    let mut counter = connect(addr, "counter").await;
    let mut history = connect(addr, "counter_history").await;
    let counter_first = next_frame(&mut counter).await;
    let history_first = next_frame(&mut history).await;
    assert_eq!(
        history_first.wrapper_props.model["state"]["active_index"],
        json!(-1)
    );

    send_event(
        &mut counter,
        CALL_FUNC,
        json!({ "path": ["actions", "inc"], "returnId": "r-1" }),
        &counter_first,
    )
    .await;

    let frame = frame_where(&mut history, |f| {
        f.wrapper_props.model["state"]["active_index"] == json!(0)
    })
    .await;
    assert_eq!(
        frame.wrapper_props.model["state"]["history"][0]["state"],
        json!({ "counter": 1 })
    );
}

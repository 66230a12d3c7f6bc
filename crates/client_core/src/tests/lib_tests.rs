use super::*;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use shared::{
    domain::MessageId,
    protocol::{WrapperProps, CALL_FUNC, MESSAGE_ACK, UPDATE_MODEL},
};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct MockState {
    received: Arc<Mutex<Vec<InboundEvent>>>,
}

async fn list_route() -> Json<Vec<String>> {
    Json(vec!["counter".to_string(), "counter_history".to_string()])
}

async fn ws_route(State(state): State<MockState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| mock_widget(socket, state))
}

async fn send_frame(socket: &mut WebSocket, model: &Value, queue: &[WireMessage]) -> bool {
    let frame = RenderFrame {
        wrapper_props: WrapperProps {
            client_id: ClientId::from("client-1"),
            messages: queue.to_vec(),
            model: model.clone(),
        },
        component_props: json!({ "title": "Counter" }),
    };
    let Ok(text) = serde_json::to_string(&frame) else {
        return false;
    };
    socket.send(WsMessage::Text(text)).await.is_ok()
}

/// Minimal backend: renders after every non-ack event, answers `add` calls and `ping`
/// messages, and drops the connection on a call to `hang`.
async fn mock_widget(mut socket: WebSocket, state: MockState) {
    let mut model = json!({ "state": { "counter": 0 } });
    let mut queue = vec![WireMessage {
        kind: "toast".to_string(),
        payload: json!("welcome"),
        id: MessageId::from("m1"),
    }];
    if !send_frame(&mut socket, &model, &queue).await {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<InboundEvent>(&text) else {
            continue;
        };
        state.received.lock().await.push(event.clone());

        match event.kind.as_str() {
            MESSAGE_ACK => {
                queue.retain(|m| json!(m.id) != event.payload);
                continue;
            }
            UPDATE_MODEL => continue,
            CALL_FUNC => {
                let return_id = event.payload["returnId"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let payload = match event.payload["path"][0].as_str() {
                    Some("add") => {
                        let sum: i64 = event.payload["args"]
                            .as_array()
                            .map(|args| args.iter().filter_map(Value::as_i64).sum())
                            .unwrap_or_default();
                        json!([sum, null])
                    }
                    Some("actions") => json!([null, null]),
                    Some("hang") => break,
                    _ => json!([null, "function not found"]),
                };
                queue.push(WireMessage {
                    kind: return_id,
                    payload,
                    id: MessageId::generate(),
                });
            }
            "ping" => {
                model["state"]["counter"] = json!(1);
                queue.push(WireMessage {
                    kind: "pong".to_string(),
                    payload: event.payload.clone(),
                    id: MessageId::from("m2"),
                });
            }
            _ => {}
        }
        if !send_frame(&mut socket, &model, &queue).await {
            break;
        }
    }
}

async fn spawn_widget_server() -> Result<(String, MockState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = MockState::default();
    let app = Router::new()
        .route("/widgets", get(list_route))
        .route("/widgets/:name/ws", get(ws_route))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

async fn wait_for_events(
    state: &MockState,
    done: impl Fn(&[InboundEvent]) -> bool,
) -> Vec<InboundEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let received = state.received.lock().await;
                if done(&received) {
                    return received.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server saw expected events")
}

#[test]
fn widget_ws_url_switches_scheme_and_appends_route() {
    let url = widget_ws_url("http://127.0.0.1:8765", "counter").expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:8765/widgets/counter/ws");

    let url = widget_ws_url("https://example.com/", "counter_history").expect("url");
    assert_eq!(url.as_str(), "wss://example.com/widgets/counter_history/ws");
}

#[test]
fn widget_ws_url_rejects_other_schemes() {
    let err = widget_ws_url("ftp://example.com", "counter").expect_err("must fail");
    assert!(err.to_string().contains("http or https"), "{err}");
    assert!(widget_ws_url("not a url", "counter").is_err());
}

#[tokio::test]
async fn list_widgets_reads_names() {
    let (server_url, _state) = spawn_widget_server().await.expect("spawn server");
    let names = list_widgets(&server_url).await.expect("list");
    assert_eq!(names, vec!["counter", "counter_history"]);
}

#[tokio::test]
async fn connect_takes_identity_and_model_from_first_frame() {
    let (server_url, state) = spawn_widget_server().await.expect("spawn server");
    let client = WidgetClient::connect(&server_url, "counter")
        .await
        .expect("connect");

    assert_eq!(client.client_id(), &ClientId::from("client-1"));
    assert_eq!(client.model()["state"]["counter"], json!(0));

    let events = wait_for_events(&state, |events| !events.is_empty()).await;
    assert_eq!(events[0].kind, MESSAGE_ACK);
    assert_eq!(events[0].payload, json!("m1"));
    assert_eq!(events[0].client_id, ClientId::from("client-1"));
}

#[tokio::test]
async fn call_resolves_with_the_remote_return() {
    let (server_url, _state) = spawn_widget_server().await.expect("spawn server");
    let client = WidgetClient::connect(&server_url, "counter")
        .await
        .expect("connect");

    let sum = client
        .call(vec!["add".into()], vec![json!(1), json!(2)])
        .await
        .expect("call");
    assert_eq!(sum, json!(3));

    let err = client
        .call(vec!["foo".into()], vec![])
        .await
        .expect_err("must fail");
    assert_eq!(err.to_string(), "remote call failed: function not found");
}

#[tokio::test]
async fn dispatch_calls_the_action_function() {
    let (server_url, state) = spawn_widget_server().await.expect("spawn server");
    let client = WidgetClient::connect(&server_url, "counter")
        .await
        .expect("connect");

    client
        .dispatch("inc", vec![json!({ "by": 2 })])
        .await
        .expect("dispatch");

    let events = wait_for_events(&state, |events| {
        events.iter().any(|event| event.kind == CALL_FUNC)
    })
    .await;
    let call = events
        .iter()
        .find(|event| event.kind == CALL_FUNC)
        .expect("call event");
    assert_eq!(call.payload["path"], json!(["actions", "inc"]));
    assert_eq!(call.payload["args"], json!([{ "by": 2 }]));
}

#[tokio::test]
async fn update_model_applies_locally_and_reaches_the_server() {
    let (server_url, state) = spawn_widget_server().await.expect("spawn server");
    let client = WidgetClient::connect(&server_url, "counter")
        .await
        .expect("connect");

    client
        .update_model(vec!["state".into(), "counter".into()], json!(7))
        .await
        .expect("update");
    assert_eq!(client.model()["state"]["counter"], json!(7));

    let events = wait_for_events(&state, |events| {
        events.iter().any(|event| event.kind == UPDATE_MODEL)
    })
    .await;
    let update = events
        .iter()
        .find(|event| event.kind == UPDATE_MODEL)
        .expect("update event");
    assert_eq!(
        update.payload,
        json!({ "path": ["state", "counter"], "value": 7 })
    );

    let err = client
        .update_model(vec!["nope".into(), "x".into()], json!(1))
        .await
        .expect_err("must fail");
    assert!(err.to_string().contains("/nope/x"), "{err}");
}

#[tokio::test]
async fn messages_and_model_changes_are_streamed() {
    let (server_url, _state) = spawn_widget_server().await.expect("spawn server");
    let client = WidgetClient::connect(&server_url, "counter")
        .await
        .expect("connect");
    let mut events = client.subscribe_events();
    let mut models = client.watch_model();

    client
        .send_message("ping", json!("hello"))
        .await
        .expect("send");

    let message = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Message(message)) => return message,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("pong within timeout");
    assert_eq!(message.kind, "pong");
    assert_eq!(message.payload, json!("hello"));

    let model = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(model) = models.next().await {
            if model["state"]["counter"] == json!(1) {
                return model;
            }
        }
        panic!("model stream ended");
    })
    .await
    .expect("model change within timeout");
    assert_eq!(model["state"]["counter"], json!(1));
}

#[tokio::test]
async fn pending_calls_fail_when_the_connection_drops() {
    let (server_url, _state) = spawn_widget_server().await.expect("spawn server");
    let client = WidgetClient::connect(&server_url, "counter")
        .await
        .expect("connect");
    let mut events = client.subscribe_events();

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.call(vec!["hang".into()], vec![]),
    )
    .await
    .expect("call settles")
    .expect_err("must fail");
    assert!(err.to_string().contains("connection closed"), "{err}");

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Closed) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .expect("close within timeout");
    assert!(closed);
}

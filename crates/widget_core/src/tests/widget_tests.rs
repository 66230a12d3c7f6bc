use super::*;
use std::{
    sync::{atomic::AtomicUsize, Mutex as StdMutex},
    time::Duration,
};

use model::path;
use serde_json::json;
use shared::protocol::{CALL_FUNC, MESSAGE_ACK, UPDATE_MODEL};

use crate::dispatcher::phase;

fn counter_widget() -> Widget {
    Widget::new("Counter", json!({}), json!({ "state": { "counter": 0 } })).expect("widget")
}

fn bump(state: &ModelView) -> anyhow::Result<()> {
    let current = state.get(&path!["counter"])?.as_i64().unwrap_or_default();
    state.set(&path!["counter"], current + 1)?;
    Ok(())
}

fn define_inc(widget: &Widget) {
    widget
        .define(
            "inc",
            Action::phased(|_| vec![phase(|ctx| bump(&ctx.state())), phase(|_| Ok(()))]),
            true,
        )
        .expect("define");
}

/// Attaches a client whose updater renders it straight away.
fn rendering_client(widget: &Widget, id: &str) -> Attachment {
    let weak = widget.downgrade();
    let client = ClientId::from(id);
    let rendering = client.clone();
    widget
        .attach(
            client,
            Arc::new(move || {
                if let Some(widget) = weak.upgrade() {
                    let _ = widget.render(&rendering);
                }
            }),
        )
        .expect("attach")
}

fn counting_client(widget: &Widget, id: &str) -> (Attachment, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    let attachment = widget
        .attach(
            ClientId::from(id),
            Arc::new(move || {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("attach");
    (attachment, count)
}

fn counter(widget: &Widget) -> Value {
    widget
        .model()
        .export_at(&path!["state", "counter"])
        .expect("export")
}

#[test]
fn construction_adds_state_and_actions_and_rejects_scalars() {
    let widget = Widget::new("Empty", json!({}), json!({ "t_state": {} })).expect("widget");
    assert_eq!(
        widget.model().export().expect("export"),
        json!({ "t_state": {}, "state": {}, "actions": {} })
    );

    let err = Widget::new("Bad", json!({}), json!(3)).err().expect("invalid");
    assert!(matches!(err, WidgetError::InvalidRoot { kind: "number" }));
}

#[tokio::test]
async fn recorded_step_action_updates_state_and_history() {
    let widget = counter_widget();
    define_inc(&widget);
    let _client = rendering_client(&widget, "A");

    let outcome = tokio::time::timeout(Duration::from_secs(1), widget.dispatch("inc", vec![]))
        .await
        .expect("dispatch finished")
        .expect("dispatch");

    assert_eq!(outcome.flushes, 2);
    assert_eq!(counter(&widget), json!(1));
    assert_eq!(widget.history().len(), 1);
    assert_eq!(
        widget
            .history()
            .get(0)
            .expect("entry")
            .state()
            .lookup(&path!["counter"])
            .expect("counter"),
        &Node::Int(1)
    );
}

#[tokio::test]
async fn update_model_is_tagged_with_the_sending_client() {
    let widget = counter_widget();
    let (_a, a_renders) = counting_client(&widget, "A");
    let (_b, b_renders) = counting_client(&widget, "B");
    let tags = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&tags);
    widget
        .model()
        .observe(move |tag| sink.lock().expect("lock").push(tag.clone()));

    widget
        .handle_event(InboundEvent::new(
            UPDATE_MODEL,
            json!({ "path": ["state", "counter"], "value": 5 }),
            ClientId::from("A"),
        ))
        .await
        .expect("update");

    assert_eq!(counter(&widget), json!(5));
    assert_eq!(
        *tags.lock().expect("lock"),
        vec![Tag::Client(ClientId::from("A"))]
    );
    assert_eq!(a_renders.load(Ordering::SeqCst), 0);
    assert_eq!(b_renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn calling_an_unregistered_function_returns_not_found() {
    let widget = counter_widget();
    let (_a, _) = counting_client(&widget, "A");
    let a = ClientId::from("A");

    widget
        .handle_event(InboundEvent::new(
            CALL_FUNC,
            json!({ "key": "foo", "returnId": "ret-1", "args": [] }),
            a.clone(),
        ))
        .await
        .expect("call_func never fails");

    let pending = widget.channel().pending(&a);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, "ret-1");
    assert_eq!(pending[0].payload, json!([null, "function not found"]));
}

#[tokio::test]
async fn actions_are_callable_as_remote_functions() {
    let widget = counter_widget();
    define_inc(&widget);
    let client = rendering_client(&widget, "A");

    tokio::time::timeout(
        Duration::from_secs(1),
        widget.handle_event(InboundEvent::new(
            CALL_FUNC,
            json!({ "path": ["actions", "inc"], "returnId": "ret-2" }),
            client.client_id().clone(),
        )),
    )
    .await
    .expect("call finished")
    .expect("call");

    assert_eq!(counter(&widget), json!(1));
    assert_eq!(widget.history().len(), 1);
    let returned: Vec<_> = widget
        .channel()
        .pending(client.client_id())
        .into_iter()
        .filter(|m| m.kind == "ret-2")
        .collect();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].payload, json!([null, null]));
    assert_eq!(
        widget.model().export_at(&path!["actions", "inc"]).expect("export"),
        json!({ "type": "function" })
    );
}

#[tokio::test]
async fn acks_through_inbound_events_are_idempotent() {
    let widget = counter_widget();
    let (_a, _) = counting_client(&widget, "A");
    let a = ClientId::from("A");
    let id = widget.send("toast", json!("saved"));
    let ack = || InboundEvent::new(MESSAGE_ACK, json!(id.as_str()), a.clone());

    widget.handle_event(ack()).await.expect("ack");
    widget.handle_event(ack()).await.expect("repeat ack");

    assert!(widget.channel().pending(&a).is_empty());
}

#[tokio::test]
async fn invalid_update_paths_are_reported_without_effect() {
    let widget = counter_widget();
    let before = widget.model().export().expect("export");
    let err = widget
        .handle_event(InboundEvent::new(
            UPDATE_MODEL,
            json!({ "path": ["missing", "counter"], "value": 1 }),
            ClientId::from("A"),
        ))
        .await
        .expect_err("not found");
    assert!(matches!(err, WidgetError::Model(ref e) if e.is_not_found()));
    assert_eq!(widget.model().export().expect("export"), before);
}

#[tokio::test]
async fn receivers_get_matching_messages_until_stopped() {
    let widget = counter_widget();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = widget.on_message("ping", move |kind, payload, client| {
        sink.lock()
            .expect("lock")
            .push((kind.to_string(), payload.clone(), client.clone()));
    });

    let ping = |n: i64| InboundEvent::new("ping", json!(n), ClientId::from("A"));
    widget.handle_event(ping(1)).await.expect("ping");
    widget
        .handle_event(InboundEvent::new("pong", json!(2), ClientId::from("A")))
        .await
        .expect("pong");
    assert!(handle.stop());
    assert!(!handle.stop());
    widget.handle_event(ping(3)).await.expect("ping");

    assert_eq!(
        *seen.lock().expect("lock"),
        vec![("ping".to_string(), json!(1), ClientId::from("A"))]
    );
}

#[tokio::test]
async fn push_after_restore_truncates_forward_history() {
    let widget = counter_widget();
    define_inc(&widget);
    for _ in 0..3 {
        widget.dispatch("inc", vec![]).await.expect("dispatch");
    }
    assert_eq!(widget.history().len(), 3);

    widget.restore_state(0).await.expect("restore");
    assert_eq!(counter(&widget), json!(1));
    assert_eq!(widget.history().len(), 3);
    assert_eq!(widget.history().current_index(), Some(0));

    widget.dispatch("inc", vec![]).await.expect("dispatch");
    assert_eq!(widget.history().len(), 2);
    assert_eq!(counter(&widget), json!(2));
}

#[tokio::test]
async fn restore_and_pop_bounds_are_enforced() {
    let widget = counter_widget();
    define_inc(&widget);
    widget.dispatch("inc", vec![]).await.expect("dispatch");

    for index in [-1, 1] {
        let err = widget.restore_state(index).await.expect_err("out of range");
        assert!(matches!(
            err,
            WidgetError::History(HistoryError::OutOfRange { len: 1, .. })
        ));
    }
    assert!(matches!(
        widget.pop_state().await,
        Err(WidgetError::History(HistoryError::NoEarlierState))
    ));
    assert_eq!(counter(&widget), json!(1));
}

#[tokio::test]
async fn detach_removes_queue_updater_and_observer() {
    let widget = counter_widget();
    let observers = widget.model().observer_count();
    let (attachment, renders) = counting_client(&widget, "A");
    assert_eq!(widget.model().observer_count(), observers + 1);

    attachment.detach();

    assert_eq!(widget.model().observer_count(), observers);
    assert!(widget.channel().clients().is_empty());
    widget
        .state()
        .set(&path!["counter"], 3)
        .expect("set");
    assert_eq!(renders.load(Ordering::SeqCst), 0);
    assert!(matches!(
        widget.render(&ClientId::from("A")),
        Err(WidgetError::UnknownClient(_))
    ));
}

#[test]
fn render_frame_exports_the_whole_model() {
    let widget = Widget::new(
        "Counter",
        json!({ "label": "clicks" }),
        json!({ "state": { "counter": 0 } }),
    )
    .expect("widget");
    define_inc(&widget);
    let (client, _) = counting_client(&widget, "A");

    let frame = widget.render(client.client_id()).expect("render");
    assert_eq!(frame.component_props, json!({ "label": "clicks" }));
    assert_eq!(
        frame.wrapper_props.model,
        json!({ "state": { "counter": 0 }, "actions": { "inc": { "type": "function" } } })
    );
}

use anyhow::{bail, Context};
use model::{path, ModelFunction, Tag};
use serde_json::{json, Value};
use widget_core::{phase, Action, ActionContext, Widget, WidgetError};

/// Counter widget: `inc(by?)` in two phases (busy flag, then the increment), `reset`,
/// and a plain remote function `add(a, b)`.
pub(crate) fn counter_widget(component_name: &str) -> Result<Widget, WidgetError> {
    let widget = Widget::new(
        component_name,
        json!({ "title": "Counter" }),
        json!({
            "state": { "counter": 0 },
            "t_state": { "busy": false },
        }),
    )?;

    widget.define(
        "inc",
        Action::phased(|args| {
            let by = args.first().and_then(Value::as_i64).unwrap_or(1);
            vec![
                phase(|ctx| set_busy(ctx, true)),
                phase(move |ctx| {
                    let state = ctx.state();
                    let current = state
                        .get(&path!["counter"])?
                        .as_i64()
                        .context("counter is not an integer")?;
                    let Some(next) = current.checked_add(by) else {
                        bail!("counter overflow: {current} + {by}");
                    };
                    state.set(&path!["counter"], next)?;
                    set_busy(ctx, false)
                }),
            ]
        }),
        true,
    )?;

    widget.define(
        "reset",
        Action::plain(|ctx, _| {
            ctx.state().set(&path!["counter"], 0)?;
            Ok(())
        }),
        true,
    )?;

    widget.model().set(
        &path!["add"],
        ModelFunction::sync(|args| match args.as_slice() {
            [a, b] => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => match a.checked_add(b) {
                    Some(sum) => Ok(json!(sum)),
                    None => bail!("add overflows: {a} + {b}"),
                },
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => Ok(json!(a + b)),
                    _ => bail!("add expects two numbers"),
                },
            },
            _ => bail!("add expects two arguments, got {}", args.len()),
        }),
        &Tag::Backend,
    )?;

    Ok(widget)
}

fn set_busy(ctx: &ActionContext, busy: bool) -> anyhow::Result<()> {
    ctx.model()
        .set(&path!["t_state", "busy"], busy, &Tag::Backend)?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/demo_tests.rs"]
mod tests;

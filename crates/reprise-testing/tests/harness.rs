use reprise_core::stream::{self, StreamItem, StreamOutput};
use reprise_core::{ScriptError, Table, Value, WidgetSpec};
use reprise_testing::prelude::*;
use serde_json::json;

fn counter_app(ctx: &mut ScriptContext<'_>) -> ScriptResult {
    ctx.markdown("# Counter")?;
    let step = ctx.number_input("Step", 1.0)?;
    if ctx.button("Increment")? {
        let count = ctx.state().user_value("count").and_then(Value::as_f64).unwrap_or(0.0);
        ctx.state_mut().set_user_value("count", json!(count + step));
    }
    let count = ctx.state().user_value("count").and_then(Value::as_f64).unwrap_or(0.0);
    ctx.markdown(format!("Count: {count}"))
}

#[test]
fn counter_follows_clicks_and_step() {
    let mut harness = ScriptHarness::new(counter_app);
    harness.start();
    assert_eq!(harness.markdown(), vec!["# Counter", "Count: 0"]);

    harness.click("Increment");
    harness.click("Increment");
    assert_eq!(harness.markdown()[1], "Count: 2");

    harness.set_value("Step", 5);
    harness.click("Increment");
    assert_eq!(harness.markdown()[1], "Count: 7");
    assert_eq!(harness.widget_value("Step"), Some(json!(5)));
    assert_eq!(harness.widget_value("Increment"), Some(json!(false)));
    assert_eq!(harness.delivered_passes(), 5);
}

#[test]
fn keyed_widget_survives_relabel() {
    let mut harness = ScriptHarness::new(|ctx| {
        let renamed = ctx.state().contains_user_value("renamed");
        let label = if renamed { "Full name" } else { "Name" };
        let value = ctx.widget(WidgetSpec::text_input(label, "").key("name"))?;
        if !renamed && value == json!("Ada") {
            ctx.state_mut().set_user_value("renamed", json!(true));
        }
        Ok(())
    });
    harness.start();
    harness.set_value("Name", "Ada");
    harness.rerun();

    assert_eq!(harness.widget_value("Full name"), Some(json!("Ada")));
    assert_eq!(harness.widget_value("Name"), None);
}

#[test]
fn periodic_fragment_only_touches_its_subtree() {
    let mut harness = ScriptHarness::new(|ctx| {
        ctx.markdown("static header")?;
        ctx.fragment_every("clock", "500ms", |ctx| {
            let now = ctx.now_millis();
            ctx.markdown(format!("now {now}"))
        })
    });
    harness.start();
    assert_eq!(harness.markdown(), vec!["static header", "now 0"]);

    assert!(harness.advance(499).is_empty());
    let reports = harness.advance(1);
    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].kind, PassKind::Fragment(_)));
    assert_eq!(harness.markdown(), vec!["static header", "now 500"]);
    assert_eq!(harness.last_deltas().len(), 1);
}

#[test]
fn streamed_answer_is_saved_and_replayed() {
    let mut harness = ScriptHarness::new(|ctx| {
        if let Some(saved) = ctx.state().user_value("answer").cloned() {
            let output: StreamOutput =
                serde_json::from_value(saved).map_err(|err| ScriptError::from_error(&err))?;
            return ctx.replay(&output);
        }
        if ctx.button("Ask")? {
            let items: Vec<StreamItem> = vec![
                "Thinking ".into(),
                "about it. ".into(),
                Table::new(["answer"]).with_row([json!(42)]).into(),
            ];
            let output = ctx.write_stream(stream::from_iter(items))?;
            let saved = serde_json::to_value(&output).map_err(|err| ScriptError::from_error(&err))?;
            ctx.state_mut().set_user_value("answer", saved);
        }
        Ok(())
    });
    harness.start();
    harness.click("Ask");
    assert_eq!(harness.markdown(), vec!["Thinking about it. "]);

    harness.rerun();
    assert_eq!(harness.markdown(), vec!["Thinking about it. "]);
    assert!(harness
        .last_deltas()
        .iter()
        .any(|delta| matches!(delta.payload, Payload::Table { .. })));
}

#[test]
fn failed_pass_reports_outcome() {
    let mut harness = ScriptHarness::new(|ctx| {
        ctx.markdown("ok so far")?;
        Err(ScriptError::api("something `broke`").into())
    });
    let reports = harness.start();
    assert_eq!(reports[0].outcome, PassOutcome::Failed);
    let deltas = harness.last_deltas();
    assert_eq!(markdown_bodies(&deltas), vec!["ok so far"]);
    assert!(deltas[1].payload.exception().is_some());
}

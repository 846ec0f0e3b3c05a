use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reprise_core::{
    BlockKind, Delta, DeltaPath, ManualClock, PassKind, PassOutcome, Payload, RuntimeConfig,
    ScriptContext, ScriptResult, Session, SessionId, Transport, Value, WidgetIdentity, WidgetSpec,
};
use serde_json::json;

#[derive(Default)]
struct Recorder {
    passes: Mutex<Vec<Vec<Delta>>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.passes.lock().unwrap().len()
    }

    fn last(&self) -> Vec<Delta> {
        self.passes.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

impl Transport for Recorder {
    fn on_pass_complete(&self, _session_id: &SessionId, deltas: Vec<Delta>) {
        self.passes.lock().unwrap().push(deltas);
    }
}

fn start<F>(clock: Arc<ManualClock>, script: F) -> (Session, Arc<Recorder>)
where
    F: Fn(&mut ScriptContext<'_>) -> ScriptResult + Send + Sync + 'static,
{
    let recorder = Arc::new(Recorder::default());
    let mut session = Session::builder(Arc::new(script), recorder.clone())
        .config(Arc::new(RuntimeConfig::default()))
        .clock(clock)
        .build();
    session.request_rerun();
    session.run_pending();
    (session, recorder)
}

fn widget_id(session: &Session, label: &str) -> WidgetIdentity {
    session
        .tree()
        .iter()
        .find_map(|(_, payload)| {
            payload
                .widget()
                .filter(|widget| widget.args["label"] == json!(label))
                .map(|widget| widget.identity.clone())
        })
        .unwrap_or_else(|| panic!("no widget labelled {label}"))
}

fn bump(ctx: &mut ScriptContext<'_>, name: &str) -> u64 {
    let next = ctx.state().user_value(name).and_then(Value::as_u64).unwrap_or(0) + 1;
    ctx.state_mut().set_user_value(name, json!(next));
    next
}

fn ticker_script(ctx: &mut ScriptContext<'_>) -> ScriptResult {
    let runs = bump(ctx, "full_runs");
    ctx.markdown(format!("header {runs}"))?;
    ctx.fragment_every("ticker", "1s", |ctx| {
        let ticks = bump(ctx, "ticks");
        ctx.markdown(format!("tick {ticks}"))
    })?;
    ctx.markdown("footer")
}

#[test]
fn run_every_fragment_reruns_alone() {
    let clock = Arc::new(ManualClock::new());
    let (mut session, recorder) = start(clock.clone(), ticker_script);
    assert_eq!(recorder.last().len(), 4);

    assert_eq!(session.tick(), 0);
    clock.advance_millis(1000);
    assert_eq!(session.tick(), 1);
    let reports = session.run_pending();

    assert_eq!(reports.len(), 1);
    let PassKind::Fragment(fragment) = reports[0].kind else {
        panic!("expected a fragment pass, got {:?}", reports[0].kind);
    };
    let mount = DeltaPath::from(vec![1]);
    let delivered = recorder.last();
    assert_eq!(delivered.len(), 1);
    assert!(delivered.iter().all(|delta| delta.path.is_nested_under(&mount)));
    assert_eq!(delivered[0].fragment, Some(fragment));
    assert_eq!(delivered[0].payload, Payload::markdown("tick 2"));

    assert_eq!(session.state().user_value("full_runs"), Some(&json!(1)));
    let shown: Vec<Payload> = session.tree().iter().map(|(_, payload)| payload.clone()).collect();
    assert_eq!(shown[0], Payload::markdown("header 1"));
    assert_eq!(shown[2], Payload::markdown("tick 2"));
    assert_eq!(shown[3], Payload::markdown("footer"));
    assert_eq!(session.next_deadline_millis(), Some(2000));
}

#[test]
fn widget_inside_fragment_reruns_only_the_fragment() {
    let (mut session, recorder) = start(Arc::new(ManualClock::new()), |ctx| {
        let runs = bump(ctx, "full_runs");
        ctx.markdown(format!("full run {runs}"))?;
        ctx.fragment("counter", None, |ctx| {
            if ctx.button("+1")? {
                bump(ctx, "count");
            }
            let count = ctx.state().user_value("count").cloned().unwrap_or(json!(0));
            ctx.markdown(format!("count {count}"))
        })
    });
    let plus = session
        .tree()
        .iter()
        .find_map(|(_, payload)| payload.widget().map(|widget| widget.identity.clone()))
        .expect("button in tree");

    session.submit_event(plus.clone(), json!(true));
    let reports = session.run_pending();

    assert!(matches!(reports[0].kind, PassKind::Fragment(_)));
    assert_eq!(session.state().user_value("full_runs"), Some(&json!(1)));
    assert_eq!(session.state().user_value("count"), Some(&json!(1)));
    let delivered = recorder.last();
    assert!(delivered.iter().all(|delta| delta.path.as_slice()[0] == 1 && delta.path.len() == 2));
    assert_eq!(session.state().get(&plus), Some(&json!(false)));
}

#[test]
fn rerun_request_collapses_pending_fragment_work() {
    let clock = Arc::new(ManualClock::new());
    let (mut session, _recorder) = start(clock.clone(), ticker_script);
    clock.advance_millis(1500);
    session.tick();
    session.request_rerun();
    let reports = session.run_pending();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, PassKind::Full);
    assert_eq!(session.state().user_value("full_runs"), Some(&json!(2)));
    assert_eq!(session.next_deadline_millis(), Some(2500));
}

#[test]
fn fragment_block_names_the_fragment() {
    let (session, _recorder) = start(Arc::new(ManualClock::new()), ticker_script);
    let block = session.tree().get(&DeltaPath::from(vec![1])).cloned();
    match block {
        Some(Payload::Block {
            block: BlockKind::Fragment { id, name },
        }) => {
            assert_eq!(name, "ticker");
            let scope = session.fragments().get(id).expect("registered fragment");
            assert_eq!(scope.run_every(), Some(Duration::from_secs(1)));
            assert_eq!(scope.mount_path(), &DeltaPath::from(vec![1]));
        }
        other => panic!("unexpected element {other:?}"),
    }
}

#[test]
fn invalid_run_every_fails_the_pass() {
    let (session, recorder) = start(Arc::new(ManualClock::new()), |ctx| {
        ctx.markdown("before")?;
        ctx.fragment_every("broken", "soon", |ctx| ctx.markdown("never"))
    });
    let delivered = recorder.last();
    let exception = delivered
        .last()
        .and_then(|delta| delta.payload.exception())
        .expect("terminal exception");
    assert!(exception.message.contains("soon"));
    assert!(exception.message_is_markdown);
    assert!(session.fragments().is_empty());
}

#[test]
fn aborted_periodic_fragment_waits_a_full_interval() {
    let colliding = Arc::new(AtomicBool::new(false));
    let flag = colliding.clone();
    let clock = Arc::new(ManualClock::new());
    let (mut session, recorder) = start(clock.clone(), move |ctx| {
        ctx.widget(WidgetSpec::text_input("Outside", "").key("shared"))?;
        let flag = flag.clone();
        ctx.fragment_every("ticker", "1s", move |ctx| {
            if flag.load(Ordering::SeqCst) {
                ctx.widget(WidgetSpec::text_input("Inside", "").key("shared"))?;
            }
            ctx.markdown("tick")
        })
    });
    colliding.store(true, Ordering::SeqCst);

    clock.advance_millis(1000);
    assert_eq!(session.tick(), 1);
    let reports = session.run_pending();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, PassOutcome::Aborted);
    let delivered_after_abort = recorder.count();

    assert_eq!(session.next_deadline_millis(), Some(2000));
    assert_eq!(session.tick(), 0);
    assert!(session.run_pending().is_empty());
    assert_eq!(recorder.count(), delivered_after_abort);

    clock.advance_millis(1000);
    assert_eq!(session.tick(), 1);
}

#[test]
fn fragment_widget_colliding_with_outside_widget_aborts() {
    let colliding = Arc::new(AtomicBool::new(false));
    let flag = colliding.clone();
    let (mut session, recorder) = start(Arc::new(ManualClock::new()), move |ctx| {
        ctx.widget(WidgetSpec::text_input("Outside", "").key("shared"))?;
        let flag = flag.clone();
        ctx.fragment("panel", None, move |ctx| {
            ctx.button("Go")?;
            if flag.load(Ordering::SeqCst) {
                ctx.widget(WidgetSpec::text_input("Inside", "").key("shared"))?;
            }
            ctx.markdown("panel")
        })
    });
    let outside = widget_id(&session, "Outside");
    session.submit_event(outside.clone(), json!("kept"));
    session.run_pending();

    colliding.store(true, Ordering::SeqCst);
    let go = widget_id(&session, "Go");
    session.submit_event(go, json!(true));
    let reports = session.run_pending();

    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].kind, PassKind::Fragment(_)));
    assert_eq!(reports[0].outcome, PassOutcome::Aborted);
    let delivered = recorder.last();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].path.as_slice(), &[1, 0]);
    let exception = delivered[0].payload.exception().expect("duplicate identity reported");
    assert!(exception.message.contains("key='shared'"));
    assert_eq!(session.state().get(&outside), Some(&json!("kept")));
    assert_eq!(session.fragments().len(), 1);
}

#[test]
fn nested_fragment_dropped_by_its_parent_stops_ticking() {
    let clock = Arc::new(ManualClock::new());
    let (mut session, recorder) = start(clock.clone(), |ctx| {
        ctx.fragment("outer", None, |ctx| {
            if ctx.button("Hide")? {
                ctx.state_mut().set_user_value("hidden", json!(true));
            }
            if ctx.state().contains_user_value("hidden") {
                return ctx.markdown("hidden");
            }
            ctx.fragment_every("inner", "1s", |ctx| {
                ctx.text_input("Inner field", "")?;
                ctx.markdown("inner")
            })
        })
    });
    assert_eq!(session.fragments().len(), 2);
    let inner_field = widget_id(&session, "Inner field");
    assert!(session.state().contains_widget(&inner_field));

    let hide = widget_id(&session, "Hide");
    session.submit_event(hide, json!(true));
    let reports = session.run_pending();
    assert!(matches!(reports[0].kind, PassKind::Fragment(_)));
    assert_eq!(reports[0].outcome, PassOutcome::Completed);

    assert_eq!(session.fragments().len(), 1);
    assert_eq!(session.next_deadline_millis(), None);
    assert!(!session.state().contains_widget(&inner_field));
    assert!(reports[0].pruned >= 1);

    let delivered = recorder.count();
    clock.advance_millis(5000);
    assert_eq!(session.tick(), 0);
    assert!(session.run_pending().is_empty());
    assert_eq!(recorder.count(), delivered);
}

#[test]
fn nested_fragment_kept_by_its_parent_keeps_its_widgets() {
    let (mut session, _recorder) = start(Arc::new(ManualClock::new()), |ctx| {
        ctx.fragment("outer", None, |ctx| {
            ctx.button("Refresh")?;
            ctx.fragment("inner", None, |ctx| {
                ctx.text_input("Inner field", "").map(drop)
            })
        })
    });
    let inner_field = widget_id(&session, "Inner field");
    session.submit_event(inner_field.clone(), json!("typed"));
    session.run_pending();

    let refresh = widget_id(&session, "Refresh");
    session.submit_event(refresh, json!(true));
    let reports = session.run_pending();

    assert!(matches!(reports[0].kind, PassKind::Fragment(_)));
    assert_eq!(reports[0].pruned, 0);
    assert_eq!(session.fragments().len(), 2);
    assert_eq!(session.state().get(&inner_field), Some(&json!("typed")));
}

#[test]
fn current_fragment_names_the_running_scope() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let (session, _recorder) = start(Arc::new(ManualClock::new()), move |ctx| {
        log.lock().unwrap().push(ctx.current_fragment());
        let log = log.clone();
        ctx.fragment("panel", None, move |ctx| {
            log.lock().unwrap().push(ctx.current_fragment());
            ctx.markdown("inside")
        })
    });
    let panel = session.fragments().iter().next().expect("panel registered").id();
    assert_eq!(*seen.lock().unwrap(), vec![None, Some(panel)]);
}

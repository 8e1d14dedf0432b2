//! End-to-end runs of whole scripts against a mock clock

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use wod_runtime::behaviors::{ChildRunnerBehavior, CompleteOnNextBehavior, TIMER_EXPIRED};
use wod_runtime::runtime::actions::BoxedAction;
use wod_runtime::runtime::behavior::{Behavior, BehaviorContext};
use wod_runtime::runtime::block::RuntimeBlock;
use wod_runtime::runtime::clock::{Clock, MockClock};
use wod_runtime::runtime::compiler::{CompileContext, JitCompiler, Strategy};
use wod_runtime::runtime::error::{BehaviorResult, CompileResult};
use wod_runtime::runtime::events::{RuntimeEvent, TIMER_COMPLETE, TIMER_PAUSE, TIMER_RESUME};
use wod_runtime::runtime::ids::BlockKey;
use wod_runtime::runtime::memory::{MemoryValue, Visibility};
use wod_runtime::runtime::stack::StackObserver;
use wod_runtime::runtime::tracker::{OutputKind, OutputStatement};
use wod_runtime::script::{Fragment, FragmentOrigin, FragmentValue, Statement};
use wod_runtime::{RuntimeConfig, ScriptRuntime, WodScript, default_compiler};

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    tag: String,
    log: Log,
}

impl Recorder {
    fn record(&self, hook: &str) {
        self.log.lock().push(format!("{}.{}", self.tag, hook));
    }
}

impl Behavior for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn on_mount(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        self.record("mount");
        ctx.allocate("scratch", MemoryValue::Bool(true), Visibility::Private);
        Ok(Vec::new())
    }

    fn on_next(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        self.record("next");
        Ok(Vec::new())
    }

    fn on_unmount(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        self.record("unmount");
        Ok(Vec::new())
    }

    fn on_dispose(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        self.record("dispose");
        Ok(Vec::new())
    }
}

/// Compiles every group into a recorded leaf completed by `next`
struct RecordedLeaves {
    log: Log,
}

impl Strategy for RecordedLeaves {
    fn name(&self) -> &'static str {
        "recorded"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn matches(&self, _statements: &[&Statement], _ctx: &CompileContext<'_>) -> bool {
        true
    }

    fn compile(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> CompileResult<RuntimeBlock> {
        let tag = statements
            .iter()
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join("+");
        let recorder = Recorder {
            tag: tag.clone(),
            log: self.log.clone(),
        };
        Ok(RuntimeBlock::new(
            "leaf",
            statements.iter().map(|s| s.id).collect(),
            vec![Box::new(recorder), Box::new(CompleteOnNextBehavior)],
        )
        .with_label(tag))
    }
}

/// Writes stack events into the shared log using block labels
struct LoggingObserver {
    log: Log,
    labels: Mutex<HashMap<BlockKey, String>>,
}

impl LoggingObserver {
    fn label(&self, key: BlockKey) -> String {
        self.labels.lock().get(&key).cloned().unwrap_or_default()
    }
}

impl StackObserver for LoggingObserver {
    fn before_push(&self, block: &RuntimeBlock, _parent: Option<BlockKey>) {
        self.labels.lock().insert(block.key(), block.label().to_string());
        self.log.lock().push(format!("push({})", block.label()));
    }

    fn on_memory_released(&self, key: BlockKey, _released: usize) {
        self.log.lock().push(format!("release({})", self.label(key)));
    }

    fn on_handlers_unregistered(&self, key: BlockKey, _removed: usize) {
        self.log.lock().push(format!("unregister({})", self.label(key)));
    }
}

fn effort(id: u32, label: &str) -> Statement {
    Statement::new(
        id,
        vec![Fragment::parsed(FragmentValue::Effort {
            label: label.to_string(),
        })],
    )
}

fn sounds(runtime: &ScriptRuntime) -> Vec<String> {
    runtime
        .get_output_statements()
        .iter()
        .filter(|o| o.kind == OutputKind::Sound)
        .map(|o| o.label.clone())
        .collect()
}

fn observed_timer_ms(segment: &OutputStatement) -> Option<u64> {
    segment.fragments.iter().find_map(|f| match (&f.value, f.origin) {
        (FragmentValue::Timer { duration_ms, .. }, FragmentOrigin::Runtime) => *duration_ms,
        _ => None,
    })
}

#[test]
fn test_pop_cleanup_precedes_parent_advance() {
    let log: Log = Arc::default();
    let script = WodScript::new(vec![effort(1, "A"), effort(2, "B")]).unwrap();
    let compiler = JitCompiler::new().with(RecordedLeaves { log: log.clone() });
    let observer = Arc::new(LoggingObserver {
        log: log.clone(),
        labels: Mutex::default(),
    });
    let mut runtime = ScriptRuntime::new(script, compiler, RuntimeConfig::default())
        .with_clock(Arc::new(MockClock::new()))
        .with_observer(observer);

    let root = RuntimeBlock::new(
        "root",
        vec![1, 2],
        vec![
            Box::new(Recorder {
                tag: "root".to_string(),
                log: log.clone(),
            }),
            Box::new(ChildRunnerBehavior::new(vec![vec![1], vec![2]])),
        ],
    )
    .with_label("root");
    runtime.start_with(root).unwrap();
    assert_eq!(
        *log.lock(),
        vec!["push(root)", "root.mount", "root.next", "push(A)", "A.mount"]
    );

    log.lock().clear();
    runtime.next().unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "A.next",
            "A.unmount",
            "A.dispose",
            "release(A)",
            "unregister(A)",
            "root.next",
            "push(B)",
            "B.mount",
        ]
    );
}

#[test]
fn test_amrap_from_script_file_expires_on_tick() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("amrap.json");
    std::fs::write(
        &path,
        r#"{
            "statements": [
                {"id": 1, "fragments": [{"type": "timer", "duration_ms": 60000, "direction": "down"}],
                 "children": [[2], [3]]},
                {"id": 2, "parent": 1, "fragments": [{"type": "rep", "count": 5}, {"type": "effort", "label": "Pull-ups"}]},
                {"id": 3, "parent": 1, "fragments": [{"type": "rep", "count": 10}, {"type": "effort", "label": "Push-ups"}]}
            ]
        }"#,
    )
    .unwrap();
    let script = WodScript::load(&path).unwrap();

    let clock = Arc::new(MockClock::new());
    let mut runtime = ScriptRuntime::new(script, default_compiler(), RuntimeConfig::default())
        .with_clock(clock.clone());

    runtime.start().unwrap();
    assert_eq!(runtime.stack().depth(), 3);
    assert_eq!(runtime.stack().current().unwrap().label(), "5 Pull-ups");
    assert_eq!(sounds(&runtime), vec!["start"]);

    clock.advance(20_000);
    runtime.next().unwrap();
    assert_eq!(runtime.stack().current().unwrap().label(), "10 Push-ups");

    clock.advance(37_500);
    runtime.tick().unwrap();
    assert_eq!(sounds(&runtime), vec!["start", "beep"]);
    assert!(!runtime.is_complete());

    clock.advance(3_500);
    runtime.tick().unwrap();
    assert!(runtime.is_complete());
    assert!(!runtime.clock().is_running());
    assert_eq!(sounds(&runtime), vec!["start", "beep", "buzzer"]);
    assert!(runtime.memory().is_empty());
    assert!(runtime.events().is_empty());

    let outputs = runtime.get_output_statements();
    assert!(
        outputs
            .iter()
            .any(|o| o.kind == OutputKind::Milestone && o.label == TIMER_COMPLETE)
    );

    let segments: Vec<&OutputStatement> = outputs
        .iter()
        .filter(|o| o.kind == OutputKind::Segment)
        .collect();
    let labels: Vec<&str> = segments.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["5 Pull-ups", "10 Push-ups", "1:00", "workout"]);

    assert_eq!(segments[0].completion_reason.as_deref(), Some("user-next"));
    assert_eq!(segments[1].completion_reason, None);
    assert_eq!(segments[2].completion_reason.as_deref(), Some(TIMER_EXPIRED));
    assert_eq!(segments[2].block_type, "amrap");
    assert_eq!(observed_timer_ms(segments[2]), Some(61_000));
    assert_eq!(segments[0].parent_key, Some(segments[2].block_key));
}

#[test]
fn test_paused_time_is_excluded() {
    let script = WodScript::new(vec![Statement::new(
        1,
        vec![Fragment::parsed(FragmentValue::Timer {
            duration_ms: Some(10_000),
            direction: Default::default(),
        })],
    )])
    .unwrap();
    let clock = Arc::new(MockClock::new());
    let mut runtime = ScriptRuntime::new(script, default_compiler(), RuntimeConfig::default())
        .with_clock(clock.clone());

    runtime.start().unwrap();
    assert_eq!(runtime.stack().current().unwrap().block_type(), "timer");

    clock.advance(4_000);
    runtime.handle(RuntimeEvent::new(TIMER_PAUSE)).unwrap();
    clock.advance(20_000);
    runtime.tick().unwrap();
    assert_eq!(runtime.stack().depth(), 2);

    runtime.handle(RuntimeEvent::new(TIMER_RESUME)).unwrap();
    clock.advance(5_000);
    runtime.tick().unwrap();
    assert_eq!(runtime.stack().depth(), 2);
    assert_eq!(sounds(&runtime), vec!["start", "beep", "beep", "beep"]);

    clock.advance(1_000);
    runtime.tick().unwrap();
    assert!(runtime.is_complete());

    let timer = runtime
        .get_output_statements()
        .iter()
        .find(|o| o.kind == OutputKind::Segment && o.block_type == "timer")
        .unwrap();
    assert_eq!(observed_timer_ms(timer), Some(10_000));
    assert_eq!(timer.completion_reason.as_deref(), Some(TIMER_EXPIRED));
}

#[test]
fn test_output_subscription_lifecycle() {
    let script = WodScript::new(vec![effort(1, "Run"), effort(2, "Row"), effort(3, "Bike")]).unwrap();
    let mut runtime = ScriptRuntime::new(script, default_compiler(), RuntimeConfig::default())
        .with_clock(Arc::new(MockClock::new()));

    let seen: Log = Arc::default();
    let sink = seen.clone();
    let subscription = runtime.subscribe_to_output(move |statement| {
        sink.lock().push(statement.label.clone());
    });

    runtime.start().unwrap();
    runtime.next().unwrap();
    assert_eq!(*seen.lock(), vec!["Run"]);

    assert!(runtime.unsubscribe_output(subscription));
    assert!(!runtime.unsubscribe_output(subscription));

    runtime.next().unwrap();
    runtime.next().unwrap();
    assert!(runtime.is_complete());
    assert_eq!(*seen.lock(), vec!["Run"]);

    let ids: Vec<u64> = runtime.get_output_statements().iter().map(|o| o.id).collect();
    assert_eq!(ids.len(), 4);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_start_is_idempotent_and_next_after_completion_is_harmless() {
    let script = WodScript::new(vec![effort(1, "Run")]).unwrap();
    let mut runtime = ScriptRuntime::new(script, default_compiler(), RuntimeConfig::default())
        .with_clock(Arc::new(MockClock::new()));

    assert!(!runtime.is_started());
    runtime.start().unwrap();
    let top = runtime.stack().current_key();
    runtime.start().unwrap();
    assert_eq!(runtime.stack().depth(), 2);
    assert_eq!(runtime.stack().current_key(), top);

    runtime.next().unwrap();
    assert!(runtime.is_complete());

    runtime.next().unwrap();
    runtime.tick().unwrap();
    assert!(runtime.is_complete());
    assert!(runtime.errors().is_empty());
    assert_eq!(runtime.get_output_statements().len(), 2);
}

#[test]
fn test_for_time_runs_children_once() {
    let script = WodScript::new(vec![
        Statement::new(
            1,
            vec![Fragment::parsed(FragmentValue::Timer {
                duration_ms: None,
                direction: Default::default(),
            })],
        )
        .with_children(vec![vec![2], vec![3]]),
        effort(2, "Row"),
        effort(3, "Run"),
    ])
    .unwrap();
    let clock = Arc::new(MockClock::new());
    let mut runtime = ScriptRuntime::new(script, default_compiler(), RuntimeConfig::default())
        .with_clock(clock.clone());

    runtime.start().unwrap();
    assert_eq!(runtime.stack().blocks()[1].block_type(), "for-time");
    assert!(sounds(&runtime).is_empty());

    clock.advance(90_000);
    runtime.next().unwrap();
    clock.advance(30_000);
    runtime.tick().unwrap();
    assert!(!runtime.is_complete());
    runtime.next().unwrap();
    assert!(runtime.is_complete());

    let for_time = runtime
        .get_output_statements()
        .iter()
        .find(|o| o.block_type == "for-time")
        .unwrap();
    assert_eq!(observed_timer_ms(for_time), Some(120_000));
    assert_eq!(for_time.completion_reason.as_deref(), Some("children-complete"));
}

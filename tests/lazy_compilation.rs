//! Integration tests for lazy child compilation
//!
//! Containers only compile a child group when their cursor reaches it.

use std::sync::Arc;

use parking_lot::Mutex;
use wod_runtime::behaviors::{
    ChildRunnerBehavior, CompleteOnNextBehavior, NO_COMPILABLE_CHILDREN, ROUNDS_MEMORY,
};
use wod_runtime::runtime::behavior::LifecycleEnv;
use wod_runtime::runtime::block::{MountOptions, NextOptions, RuntimeBlock};
use wod_runtime::runtime::clock::MockClock;
use wod_runtime::runtime::compiler::{CompileContext, JitCompiler, Strategy};
use wod_runtime::runtime::error::CompileResult;
use wod_runtime::runtime::events::EventBus;
use wod_runtime::runtime::ids::BlockKey;
use wod_runtime::runtime::memory::{MemoryStore, SearchCriteria};
use wod_runtime::runtime::tracker::OutputKind;
use wod_runtime::script::{
    Fragment, FragmentOrigin, FragmentValue, Statement, StatementId, TimerDirection,
};
use wod_runtime::strategies::TimerStrategy;
use wod_runtime::{RuntimeConfig, ScriptRuntime, WodScript, default_compiler};

type Compiled = Arc<Mutex<Vec<Vec<StatementId>>>>;

/// Leaf strategy that records every group it compiles
struct Counting {
    compiled: Compiled,
}

impl Strategy for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn matches(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> bool {
        statements.iter().all(|s| !s.has_children())
    }

    fn compile(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> CompileResult<RuntimeBlock> {
        let ids: Vec<StatementId> = statements.iter().map(|s| s.id).collect();
        self.compiled.lock().push(ids.clone());
        let label = statements
            .iter()
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join(" + ");
        Ok(RuntimeBlock::new("leaf", ids, vec![Box::new(CompleteOnNextBehavior)]).with_label(label))
    }
}

fn effort(id: StatementId, label: &str) -> Statement {
    Statement::new(
        id,
        vec![Fragment::parsed(FragmentValue::Effort {
            label: label.to_string(),
        })],
    )
}

fn counting_compiler(compiled: &Compiled) -> JitCompiler {
    default_compiler().with(Counting {
        compiled: compiled.clone(),
    })
}

#[test]
fn test_container_pushes_one_child_per_next() {
    let script = WodScript::new(vec![effort(1, "Run"), effort(2, "Row"), effort(3, "Bike")]).unwrap();
    let compiled: Compiled = Arc::default();
    let compiler = counting_compiler(&compiled);
    let mut memory = MemoryStore::new();
    let mut events = EventBus::new();

    let mut container = RuntimeBlock::new(
        "group",
        Vec::new(),
        vec![Box::new(ChildRunnerBehavior::new(vec![vec![1], vec![2], vec![3]]))],
    );
    let stack: [BlockKey; 1] = [container.key()];

    macro_rules! env {
        () => {
            LifecycleEnv {
                memory: &mut memory,
                events: &mut events,
                compiler: &compiler,
                script: &script,
                stack: &stack,
                now: MockClock::epoch(),
            }
        };
    }

    container.mount(env!(), MountOptions::default()).unwrap();
    assert!(compiled.lock().is_empty(), "mount must not compile children");

    for expected in 1..=3u32 {
        let actions = container.next(env!(), NextOptions::default()).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name(), "push-block");
        assert_eq!(compiled.lock().last(), Some(&vec![expected]));
        assert_eq!(
            container.behavior::<ChildRunnerBehavior>().unwrap().current_child_index(),
            expected as usize
        );
    }
    assert!(!container.is_complete());

    let actions = container.next(env!(), NextOptions::default()).unwrap();
    assert!(actions.is_empty());
    assert!(container.is_complete());

    let actions = container.next(env!(), NextOptions::default()).unwrap();
    assert!(actions.is_empty());
    assert_eq!(container.behavior::<ChildRunnerBehavior>().unwrap().current_child_index(), 3);
    assert_eq!(*compiled.lock(), vec![vec![1], vec![2], vec![3]]);
}

#[test]
fn test_runtime_compiles_only_reachable_children() {
    let script = WodScript::new(vec![
        effort(1, "Warmup").with_children(vec![vec![2], vec![3], vec![4]]),
        effort(2, "Run"),
        effort(3, "Row"),
        effort(4, "Bike"),
    ])
    .unwrap();
    let compiled: Compiled = Arc::default();
    let mut runtime = ScriptRuntime::new(script, counting_compiler(&compiled), RuntimeConfig::default())
        .with_clock(Arc::new(MockClock::new()));

    runtime.start().unwrap();
    assert_eq!(runtime.stack().depth(), 3);
    assert_eq!(runtime.stack().current().unwrap().label(), "Run");
    assert_eq!(*compiled.lock(), vec![vec![2]]);

    runtime.next().unwrap();
    assert_eq!(runtime.stack().current().unwrap().label(), "Row");
    assert_eq!(compiled.lock().len(), 2);

    runtime.next().unwrap();
    runtime.next().unwrap();
    assert!(runtime.is_complete());
    assert_eq!(*compiled.lock(), vec![vec![2], vec![3], vec![4]]);

    let segments: Vec<&str> = runtime
        .get_output_statements()
        .iter()
        .filter(|o| o.kind == OutputKind::Segment)
        .map(|o| o.label.as_str())
        .collect();
    assert_eq!(segments, vec!["Run", "Row", "Bike", "Warmup", "workout"]);
}

#[test]
fn test_empty_script_completes_on_start() {
    let mut runtime = ScriptRuntime::new(WodScript::default(), default_compiler(), RuntimeConfig::default())
        .with_clock(Arc::new(MockClock::new()));

    runtime.start().unwrap();
    assert!(runtime.is_complete());
    assert_eq!(runtime.get_output_statements().len(), 1);
    assert_eq!(
        runtime.get_output_statements()[0].completion_reason.as_deref(),
        Some("no-children")
    );
}

#[test]
fn test_rep_scheme_assigned_per_round() {
    let script = WodScript::new(vec![
        Statement::new(
            1,
            vec![Fragment::parsed(FragmentValue::Rounds {
                count: 3,
                scheme: vec![21, 15, 9],
            })],
        )
        .with_children(vec![vec![2]]),
        effort(2, "Thrusters"),
    ])
    .unwrap();
    let mut runtime = ScriptRuntime::new(script, default_compiler(), RuntimeConfig::default())
        .with_clock(Arc::new(MockClock::new()));

    runtime.start().unwrap();
    let rounds = runtime.memory().search(&SearchCriteria::of_type(ROUNDS_MEMORY));
    assert_eq!(rounds.len(), 1);
    assert_eq!(runtime.memory().get(&rounds[0]).and_then(|v| v.as_integer()), Some(1));

    runtime.next().unwrap();
    assert_eq!(runtime.memory().get(&rounds[0]).and_then(|v| v.as_integer()), Some(2));
    runtime.next().unwrap();
    runtime.next().unwrap();
    assert!(runtime.is_complete());
    assert!(runtime.memory().is_empty());

    let reps: Vec<u32> = runtime
        .get_output_statements()
        .iter()
        .filter(|o| o.kind == OutputKind::Segment && o.label == "Thrusters")
        .filter_map(|o| {
            o.fragments.iter().find_map(|f| match (&f.value, f.origin) {
                (FragmentValue::Rep { count }, FragmentOrigin::Compiler) => Some(*count),
                _ => None,
            })
        })
        .collect();
    assert_eq!(reps, vec![21, 15, 9]);
}

#[test]
fn test_amrap_with_uncompilable_children_terminates() {
    let script = WodScript::new(vec![
        Statement::new(
            1,
            vec![Fragment::parsed(FragmentValue::Timer {
                duration_ms: Some(60_000),
                direction: TimerDirection::Down,
            })],
        )
        .with_children(vec![vec![2]]),
        effort(2, "Burpees"),
    ])
    .unwrap();
    let compiler = JitCompiler::new().with(TimerStrategy);
    let mut runtime = ScriptRuntime::new(script, compiler, RuntimeConfig::default())
        .with_clock(Arc::new(MockClock::new()));

    runtime.start().unwrap();
    assert!(runtime.is_complete());

    let amrap = runtime
        .get_output_statements()
        .iter()
        .find(|o| o.kind == OutputKind::Segment && o.block_type == "amrap")
        .unwrap();
    assert_eq!(amrap.completion_reason.as_deref(), Some(NO_COMPILABLE_CHILDREN));
}

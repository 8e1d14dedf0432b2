//! Reference compilation strategies
//!
//! Each strategy maps one shape of statement group onto a block type and
//! the behaviors that drive it. [`default_compiler`] registers all of them;
//! [`EffortStrategy`] matches everything and sits last as the fallback.

use crate::behaviors::{
    ChildRunnerBehavior, CompleteOnNextBehavior, SoundCueBehavior, TimerBehavior,
};
use crate::runtime::behavior::Behavior;
use crate::runtime::block::RuntimeBlock;
use crate::runtime::compiler::{CompileContext, JitCompiler, Strategy};
use crate::runtime::error::{CompileError, CompileResult};
use crate::script::{FragmentType, FragmentValue, Statement, WodScript};

/// Block type of the synthetic root
pub const ROOT_BLOCK: &str = "root";

/// Build a block over `statements` carrying their fragments and a joined label
fn build(block_type: &str, statements: &[&Statement], behaviors: Vec<Box<dyn Behavior>>) -> RuntimeBlock {
    let label = statements
        .iter()
        .map(|s| s.label())
        .collect::<Vec<_>>()
        .join(" + ");
    let fragments = statements
        .iter()
        .flat_map(|s| s.fragments.iter().cloned())
        .collect();

    RuntimeBlock::new(block_type, statements.iter().map(|s| s.id).collect(), behaviors)
        .with_label(label)
        .with_fragments(fragments)
}

fn single<'s>(statements: &[&'s Statement]) -> Option<&'s Statement> {
    match statements {
        [only] => Some(*only),
        _ => None,
    }
}

fn no_strategy(statements: &[&Statement]) -> CompileError {
    CompileError::NoStrategy {
        statement_ids: statements.iter().map(|s| s.id).collect(),
    }
}

/// Timers: countdowns, stopwatches, AMRAPs and "for time" containers.
///
/// A bound timer with children repeats them until it expires; an unbound
/// one runs them once (or for its declared rounds).
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerStrategy;

impl Strategy for TimerStrategy {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn matches(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> bool {
        single(statements).is_some_and(|s| s.has_fragment(FragmentType::Timer))
    }

    fn compile(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> CompileResult<RuntimeBlock> {
        let statement = single(statements).ok_or_else(|| no_strategy(statements))?;
        let Some(FragmentValue::Timer {
            duration_ms,
            direction,
        }) = statement.fragment(FragmentType::Timer).map(|f| &f.value)
        else {
            return Err(no_strategy(statements));
        };

        let mut behaviors: Vec<Box<dyn Behavior>> =
            vec![Box::new(TimerBehavior::new(*duration_ms, *direction))];

        let block_type = if statement.has_children() {
            let declared = match statement.fragment(FragmentType::Rounds).map(|f| &f.value) {
                Some(FragmentValue::Rounds { count, .. }) => Some(*count),
                _ => None,
            };
            let rounds = match (declared, duration_ms) {
                (Some(count), _) => count,
                (None, Some(_)) => u32::MAX,
                (None, None) => 1,
            };
            behaviors.push(Box::new(
                ChildRunnerBehavior::new(statement.children.clone()).with_rounds(rounds),
            ));
            if duration_ms.is_some() { "amrap" } else { "for-time" }
        } else {
            behaviors.push(Box::new(CompleteOnNextBehavior));
            "timer"
        };

        if let Some(ms) = duration_ms {
            behaviors.push(Box::new(SoundCueBehavior::countdown(*ms)));
        }

        Ok(build(block_type, statements, behaviors))
    }
}

/// Fixed-round containers, with an optional per-round rep scheme
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundsStrategy;

impl Strategy for RoundsStrategy {
    fn name(&self) -> &'static str {
        "rounds"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn matches(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> bool {
        single(statements)
            .is_some_and(|s| s.has_fragment(FragmentType::Rounds) && s.has_children())
    }

    fn compile(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> CompileResult<RuntimeBlock> {
        let statement = single(statements).ok_or_else(|| no_strategy(statements))?;
        let Some(FragmentValue::Rounds { count, scheme }) =
            statement.fragment(FragmentType::Rounds).map(|f| &f.value)
        else {
            return Err(no_strategy(statements));
        };

        // "21-15-9" implies three rounds even without an explicit count
        let rounds = if scheme.is_empty() {
            *count
        } else {
            (*count).max(scheme.len() as u32)
        };
        let runner = ChildRunnerBehavior::new(statement.children.clone())
            .with_rounds(rounds)
            .with_rep_scheme(scheme.clone());

        Ok(build("rounds", statements, vec![Box::new(runner)]))
    }
}

/// Plain containers: run each child group once
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupStrategy;

impl Strategy for GroupStrategy {
    fn name(&self) -> &'static str {
        "group"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn matches(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> bool {
        single(statements).is_some_and(Statement::has_children)
    }

    fn compile(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> CompileResult<RuntimeBlock> {
        let statement = single(statements).ok_or_else(|| no_strategy(statements))?;
        let runner = ChildRunnerBehavior::new(statement.children.clone());
        Ok(build("group", statements, vec![Box::new(runner)]))
    }
}

/// Leaf efforts, completed by the user's `next`. Matches anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct EffortStrategy;

impl Strategy for EffortStrategy {
    fn name(&self) -> &'static str {
        "effort"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn matches(&self, _statements: &[&Statement], _ctx: &CompileContext<'_>) -> bool {
        true
    }

    fn compile(&self, statements: &[&Statement], _ctx: &CompileContext<'_>) -> CompileResult<RuntimeBlock> {
        Ok(build("effort", statements, vec![Box::new(CompleteOnNextBehavior)]))
    }
}

/// Registry with every reference strategy
pub fn default_compiler() -> JitCompiler {
    JitCompiler::new()
        .with(TimerStrategy)
        .with(RoundsStrategy)
        .with(GroupStrategy)
        .with(EffortStrategy)
}

/// Synthetic root running each top-level statement as its own group
pub fn root_block(script: &WodScript) -> RuntimeBlock {
    let roots: Vec<_> = script.roots().iter().map(|s| s.id).collect();
    let groups = roots.iter().map(|id| vec![*id]).collect();
    RuntimeBlock::new(ROOT_BLOCK, roots, vec![Box::new(ChildRunnerBehavior::new(groups))])
        .with_label("workout")
}

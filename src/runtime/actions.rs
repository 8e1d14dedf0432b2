//! Declarative actions and the phase-ordered dispatcher
//!
//! Hooks and handlers never mutate the runtime directly; they return
//! actions. The dispatcher groups a batch by phase and runs each phase to
//! completion, in emission order, before the next one:
//! `immediate < display < memory < side-effect < event < stack`.
//! Event actions are fully resolved (including whatever they trigger)
//! before any stack mutation from the same batch runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ScriptRuntime;
use super::block::RuntimeBlock;
use super::clock::Timestamp;
use super::error::{Result, RuntimeError};
use super::events::RuntimeEvent;
use super::ids::BlockKey;
use super::memory::{MemoryRef, MemoryValue};
use super::tracker::{OutputKind, OutputStatement};

/// Execution bucket for an action
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ActionPhase {
    /// Unphased; runs first, inline with emission order
    #[default]
    Immediate,
    /// Host-facing output
    Display,
    /// Memory writes
    Memory,
    /// Sounds and other external effects
    SideEffect,
    /// Event emission
    Event,
    /// Push/pop
    Stack,
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionPhase::Immediate => "immediate",
            ActionPhase::Display => "display",
            ActionPhase::Memory => "memory",
            ActionPhase::SideEffect => "side-effect",
            ActionPhase::Event => "event",
            ActionPhase::Stack => "stack",
        };
        f.write_str(name)
    }
}

/// A deferred runtime operation
pub trait RuntimeAction: Send + fmt::Debug {
    /// Action name for logs
    fn name(&self) -> &'static str;

    /// Phase this action runs in
    fn phase(&self) -> ActionPhase {
        ActionPhase::Immediate
    }

    /// Apply the action
    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()>;
}

/// Owned, type-erased action
pub type BoxedAction = Box<dyn RuntimeAction>;

/// Push a compiled block
#[derive(Debug)]
pub struct PushBlockAction {
    block: RuntimeBlock,
    start_time: Option<Timestamp>,
}

impl PushBlockAction {
    /// Push `block`, mounting it at the clock's current time
    pub fn new(block: RuntimeBlock) -> Self {
        Self {
            block,
            start_time: None,
        }
    }

    /// Push `block`, mounting it at `start_time`
    pub fn at(block: RuntimeBlock, start_time: Timestamp) -> Self {
        Self {
            block,
            start_time: Some(start_time),
        }
    }

    /// The block to be pushed
    pub fn block(&self) -> &RuntimeBlock {
        &self.block
    }
}

impl RuntimeAction for PushBlockAction {
    fn name(&self) -> &'static str {
        "push-block"
    }

    fn phase(&self) -> ActionPhase {
        ActionPhase::Stack
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        runtime.push_block_at(self.block, self.start_time)
    }
}

/// Pop the current block
#[derive(Debug, Default)]
pub struct PopBlockAction;

impl RuntimeAction for PopBlockAction {
    fn name(&self) -> &'static str {
        "pop-block"
    }

    fn phase(&self) -> ActionPhase {
        ActionPhase::Stack
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        runtime.pop_block().map(|_| ())
    }
}

/// Run `next` on a block still on the stack.
///
/// Containers return this from `on_mount` so a pushed container enters its
/// first child without waiting for a host event. A block that has already
/// left the stack is ignored.
#[derive(Debug)]
pub struct AdvanceBlockAction {
    key: BlockKey,
}

impl AdvanceBlockAction {
    /// Advance `key`
    pub fn new(key: BlockKey) -> Self {
        Self { key }
    }
}

impl RuntimeAction for AdvanceBlockAction {
    fn name(&self) -> &'static str {
        "advance-block"
    }

    fn phase(&self) -> ActionPhase {
        ActionPhase::Stack
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        let actions = runtime.next_block(self.key)?;
        ActionDispatcher::execute(runtime, actions)
    }
}

/// Emit an event through the bus and run whatever it triggers
#[derive(Debug)]
pub struct EmitEventAction {
    event: RuntimeEvent,
}

impl EmitEventAction {
    /// Emit `event`
    pub fn new(event: RuntimeEvent) -> Self {
        Self { event }
    }
}

impl RuntimeAction for EmitEventAction {
    fn name(&self) -> &'static str {
        "emit-event"
    }

    fn phase(&self) -> ActionPhase {
        ActionPhase::Event
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        runtime.dispatch_event(self.event)
    }
}

/// Write a memory entry
#[derive(Debug)]
pub struct SetMemoryAction {
    reference: MemoryRef,
    value: MemoryValue,
}

impl SetMemoryAction {
    /// Set `reference` to `value`
    pub fn new(reference: MemoryRef, value: MemoryValue) -> Self {
        Self { reference, value }
    }
}

impl RuntimeAction for SetMemoryAction {
    fn name(&self) -> &'static str {
        "set-memory"
    }

    fn phase(&self) -> ActionPhase {
        ActionPhase::Memory
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        runtime.memory_mut().set(&self.reference, self.value)?;
        Ok(())
    }
}

/// Publish an output statement to the host
#[derive(Debug)]
pub struct EmitOutputAction {
    statement: OutputStatement,
}

impl EmitOutputAction {
    /// Publish `statement`
    pub fn new(statement: OutputStatement) -> Self {
        Self { statement }
    }
}

impl RuntimeAction for EmitOutputAction {
    fn name(&self) -> &'static str {
        "emit-output"
    }

    fn phase(&self) -> ActionPhase {
        ActionPhase::Display
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        runtime.emit_output(self.statement);
        Ok(())
    }
}

/// Ask the host to play a sound cue
#[derive(Debug)]
pub struct PlaySoundAction {
    block: BlockKey,
    sound: String,
}

impl PlaySoundAction {
    /// Play `sound` on behalf of `block`
    pub fn new(block: BlockKey, sound: impl Into<String>) -> Self {
        Self {
            block,
            sound: sound.into(),
        }
    }
}

impl RuntimeAction for PlaySoundAction {
    fn name(&self) -> &'static str {
        "play-sound"
    }

    fn phase(&self) -> ActionPhase {
        ActionPhase::SideEffect
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        let now = runtime.now();
        let statement = OutputStatement::notice(OutputKind::Sound, self.block, self.sound, now);
        runtime.emit_output(statement);
        Ok(())
    }
}

/// Append to the runtime's error list
#[derive(Debug)]
pub struct ReportErrorAction {
    source: String,
    message: String,
}

impl ReportErrorAction {
    /// Record `message` raised by `source`
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

impl RuntimeAction for ReportErrorAction {
    fn name(&self) -> &'static str {
        "report-error"
    }

    fn execute(self: Box<Self>, runtime: &mut ScriptRuntime) -> Result<()> {
        runtime.record_error(self.source, self.message);
        Ok(())
    }
}

/// Phase-ordered batch executor
#[derive(Debug)]
pub struct ActionDispatcher {
    max_depth: usize,
    depth: usize,
    executed: u64,
}

impl ActionDispatcher {
    /// Dispatcher allowing `max_depth` nested batches
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            depth: 0,
            executed: 0,
        }
    }

    /// Current batch nesting
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total actions executed
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Order a batch by phase, keeping emission order within a phase
    pub fn partition(mut actions: Vec<BoxedAction>) -> Vec<BoxedAction> {
        actions.sort_by_key(|action| action.phase());
        actions
    }

    /// Execute a batch against `runtime`.
    ///
    /// Actions may trigger nested batches (a pop advancing the parent, an
    /// emitted event); nesting beyond the configured limit fails. The first
    /// failing action aborts the rest of its batch.
    pub fn execute(runtime: &mut ScriptRuntime, actions: Vec<BoxedAction>) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }

        let dispatcher = runtime.dispatcher_mut();
        if dispatcher.depth >= dispatcher.max_depth {
            return Err(RuntimeError::ActionDepthExceeded {
                max: dispatcher.max_depth,
            });
        }
        dispatcher.depth += 1;

        let result = Self::run_batch(runtime, Self::partition(actions));

        runtime.dispatcher_mut().depth -= 1;
        result
    }

    fn run_batch(runtime: &mut ScriptRuntime, actions: Vec<BoxedAction>) -> Result<()> {
        for action in actions {
            let name = action.name();
            let phase = action.phase();
            tracing::trace!(action = name, phase = %phase, "execute action");
            runtime.observer().on_action(name, phase);
            runtime.dispatcher_mut().executed += 1;

            if let Err(err) = action.execute(runtime) {
                tracing::warn!(action = name, phase = %phase, error = %err, "action failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Tagged(ActionPhase, usize);

    impl RuntimeAction for Tagged {
        fn name(&self) -> &'static str {
            "tagged"
        }

        fn phase(&self) -> ActionPhase {
            self.0
        }

        fn execute(self: Box<Self>, _runtime: &mut ScriptRuntime) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_phase_ordering() {
        assert!(ActionPhase::Immediate < ActionPhase::Display);
        assert!(ActionPhase::Display < ActionPhase::Memory);
        assert!(ActionPhase::Memory < ActionPhase::SideEffect);
        assert!(ActionPhase::SideEffect < ActionPhase::Event);
        assert!(ActionPhase::Event < ActionPhase::Stack);
    }

    #[test]
    fn test_partition_stable_within_phase() {
        let batch: Vec<BoxedAction> = vec![
            Box::new(Tagged(ActionPhase::Stack, 0)),
            Box::new(Tagged(ActionPhase::Display, 1)),
            Box::new(Tagged(ActionPhase::Event, 2)),
            Box::new(Tagged(ActionPhase::Display, 3)),
            Box::new(Tagged(ActionPhase::Immediate, 4)),
            Box::new(Tagged(ActionPhase::Stack, 5)),
        ];

        let ordered: Vec<String> = ActionDispatcher::partition(batch)
            .iter()
            .map(|a| format!("{:?}", a))
            .collect();
        assert_eq!(
            ordered,
            vec![
                "Tagged(Immediate, 4)",
                "Tagged(Display, 1)",
                "Tagged(Display, 3)",
                "Tagged(Event, 2)",
                "Tagged(Stack, 0)",
                "Tagged(Stack, 5)",
            ]
        );
    }
}

//! Runtime orchestrator and public API
//!
//! [`ScriptRuntime`] owns every subsystem of the execution core (stack,
//! memory, event bus, clock, compiler, tracker, action dispatcher) and
//! exposes the host interface: start a script, feed it events, read its
//! output.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub mod actions;
pub mod behavior;
pub mod block;
pub mod clock;
pub mod compiler;
pub mod error;
pub mod events;
pub mod ids;
pub mod memory;
pub mod stack;
pub mod tracker;

use actions::{ActionDispatcher, BoxedAction};
use behavior::LifecycleEnv;
use block::RuntimeBlock;
use clock::{Clock, SystemClock, Timestamp};
use compiler::JitCompiler;
use error::{HandlerError, HandlerResult, Result, RuntimeErrorRecord, StackError, StackResult};
use events::{EventBus, RuntimeEvent};
use ids::{BlockKey, SubscriptionId};
use memory::MemoryStore;
use stack::{RuntimeStack, StackObserver, TracingObserver};
use tracker::{ExecutionTracker, OutputStatement};

use crate::script::WodScript;

pub use error::RuntimeError;

/// Configuration for the workout runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of blocks on the stack
    pub max_stack_depth: usize,

    /// Maximum nesting of action batches
    pub max_action_depth: usize,

    /// Host tick cadence in milliseconds
    pub tick_interval_ms: u64,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: 10,
            max_action_depth: 32,
            tick_interval_ms: 100,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: RuntimeConfig =
            serde_json::from_slice(&data).context("Failed to deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Reject limits the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.max_stack_depth == 0 {
            return Err(RuntimeError::Config("max_stack_depth must be at least 1".into()));
        }
        if self.max_action_depth == 0 {
            return Err(RuntimeError::Config("max_action_depth must be at least 1".into()));
        }
        Ok(())
    }
}

/// The workout script interpreter
pub struct ScriptRuntime {
    config: RuntimeConfig,
    script: Arc<WodScript>,
    compiler: Arc<JitCompiler>,
    clock: Arc<dyn Clock>,
    stack: RuntimeStack,
    memory: MemoryStore,
    events: EventBus,
    tracker: ExecutionTracker,
    dispatcher: ActionDispatcher,
    observer: Arc<dyn StackObserver>,
    errors: Vec<RuntimeErrorRecord>,
    started: bool,
    dispatch_depth: usize,
}

impl ScriptRuntime {
    /// Create a runtime for `script` using the system clock
    pub fn new(script: WodScript, compiler: JitCompiler, config: RuntimeConfig) -> Self {
        Self {
            stack: RuntimeStack::new(config.max_stack_depth),
            dispatcher: ActionDispatcher::new(config.max_action_depth),
            config,
            script: Arc::new(script),
            compiler: Arc::new(compiler),
            clock: Arc::new(SystemClock::new()),
            memory: MemoryStore::new(),
            events: EventBus::new(),
            tracker: ExecutionTracker::new(),
            observer: Arc::new(TracingObserver),
            errors: Vec::new(),
            started: false,
            dispatch_depth: 0,
        }
    }

    /// Replace the clock (mock clocks in tests, shared clocks in hosts)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the stack observer
    pub fn with_observer(mut self, observer: Arc<dyn StackObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Start the script: push a root block over the top-level statements.
    /// The root enters its first child while mounting.
    pub fn start(&mut self) -> Result<()> {
        let root = crate::strategies::root_block(&self.script);
        self.start_with(root)
    }

    /// Start with a caller-built root block
    pub fn start_with(&mut self, root: RuntimeBlock) -> Result<()> {
        if self.started {
            tracing::warn!("runtime already started");
            return Ok(());
        }
        self.started = true;

        let at = self.clock.start();
        tracing::info!(
            statements = self.script.len(),
            strategies = ?self.compiler.list_strategies(),
            at = %at,
            "starting script"
        );

        let result = self.push_block(root).and_then(|_| self.sweep_completed());
        if let Err(err) = &result {
            self.record_error("start", err.to_string());
        }
        result
    }

    /// Feed a host event through the bus, execute the resulting actions and
    /// pop whatever completed.
    pub fn handle(&mut self, event: RuntimeEvent) -> Result<()> {
        tracing::debug!(event = %event.name, depth = self.stack.depth(), "handle");
        let result = self
            .dispatch_event(event)
            .and_then(|_| self.sweep_completed());
        if let Err(err) = &result {
            self.record_error("handle", err.to_string());
        }
        result
    }

    /// Send the host "next" event
    pub fn next(&mut self) -> Result<()> {
        self.handle(RuntimeEvent::next())
    }

    /// Send a clock tick
    pub fn tick(&mut self) -> Result<()> {
        self.handle(RuntimeEvent::tick())
    }

    /// Dispatch an event and execute its actions, without the completion sweep
    pub fn dispatch_event(&mut self, mut event: RuntimeEvent) -> Result<()> {
        if event.timestamp.is_none() {
            event.timestamp = Some(self.now());
        }
        let actions = EventBus::dispatch(self, &event);
        ActionDispatcher::execute(self, actions)
    }

    /// Run `next` on a block on behalf of an event route
    pub fn advance_block(&mut self, key: BlockKey) -> HandlerResult<Vec<BoxedAction>> {
        match self.with_block(key, |block, env| block.next(env, Default::default())) {
            Some(result) => Ok(result?),
            None => Err(HandlerError::BlockNotFound(key)),
        }
    }

    /// Deliver an event to a block's interested behaviors
    pub fn deliver_event(&mut self, key: BlockKey, event: &RuntimeEvent) -> HandlerResult<Vec<BoxedAction>> {
        match self.with_block(key, |block, env| block.handle_event(env, event)) {
            Some(result) => Ok(result?),
            None => Err(HandlerError::BlockNotFound(key)),
        }
    }

    /// Whether the script ran to completion
    pub fn is_complete(&self) -> bool {
        self.started && self.stack.is_empty()
    }

    /// Whether an event dispatch is running; push and pop are refused meanwhile
    pub fn is_dispatching(&self) -> bool {
        self.dispatch_depth > 0
    }

    fn ensure_not_dispatching(&self, operation: &'static str) -> StackResult<()> {
        if self.is_dispatching() {
            tracing::warn!(operation, "stack mutation refused during dispatch");
            return Err(StackError::Reentrant { operation });
        }
        Ok(())
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Append to the error list
    pub fn record_error(&mut self, source: impl Into<String>, message: impl Into<String>) {
        let record = RuntimeErrorRecord {
            timestamp: self.now(),
            source: source.into(),
            message: message.into(),
        };
        tracing::error!(source = %record.source, message = %record.message, "runtime error");
        self.errors.push(record);
    }

    /// Recorded errors, oldest first
    pub fn errors(&self) -> &[RuntimeErrorRecord] {
        &self.errors
    }

    /// Publish an output statement
    pub fn emit_output(&mut self, statement: OutputStatement) {
        self.tracker.emit(statement);
    }

    /// Register an output listener
    pub fn subscribe_to_output<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&OutputStatement) + Send + 'static,
    {
        self.tracker.subscribe(Box::new(listener))
    }

    /// Remove an output listener
    pub fn unsubscribe_output(&mut self, id: SubscriptionId) -> bool {
        self.tracker.unsubscribe(id)
    }

    /// Every output statement emitted so far
    pub fn get_output_statements(&self) -> &[OutputStatement] {
        self.tracker.outputs()
    }

    /// Execution tracker
    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    /// Current instant
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// The clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The stack
    pub fn stack(&self) -> &RuntimeStack {
        &self.stack
    }

    /// Memory store
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Mutable memory store
    pub fn memory_mut(&mut self) -> &mut MemoryStore {
        &mut self.memory
    }

    /// Event bus
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Mutable event bus, for host-level handler registration
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Script being executed
    pub fn script(&self) -> &WodScript {
        &self.script
    }

    /// Strategy registry
    pub fn compiler(&self) -> &JitCompiler {
        &self.compiler
    }

    /// Configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Injected observer
    pub fn observer(&self) -> &dyn StackObserver {
        self.observer.as_ref()
    }

    pub(crate) fn dispatcher_mut(&mut self) -> &mut ActionDispatcher {
        &mut self.dispatcher
    }

    /// Run `f` against a block on the stack with split borrows of the
    /// services its lifecycle calls need
    fn with_block<T>(
        &mut self,
        key: BlockKey,
        f: impl FnOnce(&mut RuntimeBlock, LifecycleEnv<'_>) -> T,
    ) -> Option<T> {
        let keys = self.stack.keys();
        let now = self.clock.now();
        let block = self.stack.get_mut(key)?;
        let env = LifecycleEnv {
            memory: &mut self.memory,
            events: &mut self.events,
            compiler: &*self.compiler,
            script: &*self.script,
            stack: &keys,
            now,
        };
        Some(f(block, env))
    }
}

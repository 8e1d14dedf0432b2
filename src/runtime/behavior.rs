//! Behaviors and the per-call context they run against
//!
//! A behavior is a small composable unit implementing any subset of the
//! lifecycle hooks. Hooks never touch the stack; they read and write through
//! a [`BehaviorContext`] and return actions for the dispatcher to execute.
//! Each behavior declares up front which events it wants routed to it.

use std::any::Any;
use std::sync::Arc;

use super::actions::BoxedAction;
use super::block::{BlockCore, FragmentStore, RuntimeBlock};
use super::clock::{SnapshotClock, TimeSource, Timestamp};
use super::compiler::{CompileContext, JitCompiler};
use super::error::{BehaviorResult, CompileResult, MemoryResult};
use super::events::{EventBus, EventHandler, HandlerOptions, HandlerScope, RuntimeEvent};
use super::ids::{BlockKey, HandlerId};
use super::memory::{MemoryRef, MemoryStore, MemoryValue, SearchCriteria, Visibility};
use crate::script::{Fragment, StatementId, WodScript};

/// An event a behavior wants routed to its `on_event` hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInterest {
    /// Event name (or `*`)
    pub event_name: String,
    /// Scope the block route is registered with
    pub scope: HandlerScope,
    /// Route priority
    pub priority: i32,
}

impl EventInterest {
    /// Interest in `event_name` under `scope`
    pub fn new(event_name: impl Into<String>, scope: HandlerScope) -> Self {
        Self {
            event_name: event_name.into(),
            scope,
            priority: 0,
        }
    }
}

/// Capabilities a behavior declares at construction
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Events routed to `on_event`
    pub events: Vec<EventInterest>,
}

impl Capabilities {
    /// No capabilities beyond the lifecycle hooks
    pub fn none() -> Self {
        Self::default()
    }

    /// Add an event interest
    pub fn listens(mut self, event_name: impl Into<String>, scope: HandlerScope) -> Self {
        self.events.push(EventInterest::new(event_name, scope));
        self
    }

    /// Whether `event_name` is routed to this behavior
    pub fn wants(&self, event_name: &str) -> bool {
        self.events
            .iter()
            .any(|i| i.event_name == event_name || i.event_name == super::events::WILDCARD)
    }
}

/// A composable lifecycle unit
///
/// Every hook is optional; the defaults return no actions.
pub trait Behavior: Any + Send {
    /// Name for logs and errors
    fn name(&self) -> &'static str;

    /// Declared event interests
    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
    }

    /// Block was pushed
    fn on_mount(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        Ok(Vec::new())
    }

    /// Reset per-call state before any behavior's `on_next` runs
    fn prepare(&mut self) {}

    /// Block was asked to advance
    fn on_next(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        Ok(Vec::new())
    }

    /// Block is being popped
    fn on_unmount(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        Ok(Vec::new())
    }

    /// Block is being disposed
    fn on_dispose(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        Ok(Vec::new())
    }

    /// A declared event reached this block
    fn on_event(
        &mut self,
        _event: &RuntimeEvent,
        _ctx: &mut BehaviorContext<'_>,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        Ok(Vec::new())
    }
}

/// Shared runtime services handed to a block lifecycle call
pub struct LifecycleEnv<'a> {
    /// Scoped memory
    pub memory: &'a mut MemoryStore,
    /// Event registrations
    pub events: &'a mut EventBus,
    /// Strategy registry for lazy child compilation
    pub compiler: &'a JitCompiler,
    /// Script being executed
    pub script: &'a WodScript,
    /// Stack keys, root first, at the time of the call
    pub stack: &'a [BlockKey],
    /// Instant every behavior in this call observes
    pub now: Timestamp,
}

/// Context passed to each behavior hook
pub struct BehaviorContext<'a> {
    block: &'a mut BlockCore,
    memory: &'a mut MemoryStore,
    events: &'a mut EventBus,
    compiler: &'a JitCompiler,
    script: &'a WodScript,
    stack: &'a [BlockKey],
    clock: SnapshotClock,
    subscriptions: Vec<HandlerId>,
}

impl<'a> BehaviorContext<'a> {
    pub(crate) fn new(block: &'a mut BlockCore, env: LifecycleEnv<'a>) -> Self {
        Self {
            block,
            memory: env.memory,
            events: env.events,
            compiler: env.compiler,
            script: env.script,
            stack: env.stack,
            clock: SnapshotClock::at(env.now),
            subscriptions: Vec::new(),
        }
    }

    /// Key of the block being driven
    pub fn key(&self) -> BlockKey {
        self.block.key
    }

    /// Statements the block was compiled from
    pub fn source_ids(&self) -> &[StatementId] {
        &self.block.source_ids
    }

    /// Frozen instant for this call
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Mark the block complete; the first reason wins
    pub fn mark_complete(&mut self, reason: impl Into<String>) {
        self.block.mark_complete(reason);
    }

    /// Whether the block is already complete
    pub fn is_complete(&self) -> bool {
        self.block.is_complete()
    }

    /// Block fragments
    pub fn fragments(&self) -> &FragmentStore {
        &self.block.fragments
    }

    /// Record a fragment on the block
    pub fn add_fragment(&mut self, fragment: Fragment) {
        self.block.fragments.add(fragment);
    }

    /// Script being executed
    pub fn script(&self) -> &WodScript {
        self.script
    }

    /// Stack keys, root first
    pub fn stack(&self) -> &[BlockKey] {
        self.stack
    }

    /// Blocks below this one, root first
    pub fn ancestors(&self) -> &[BlockKey] {
        match self.stack.iter().position(|k| *k == self.block.key) {
            Some(pos) => &self.stack[..pos],
            None => self.stack,
        }
    }

    /// Allocate memory owned by this block
    pub fn allocate(
        &mut self,
        memory_type: impl Into<String>,
        initial: MemoryValue,
        visibility: Visibility,
    ) -> MemoryRef {
        self.memory
            .allocate(memory_type, self.block.key, initial, visibility)
    }

    /// Read an entry
    pub fn get(&self, reference: &MemoryRef) -> Option<&MemoryValue> {
        self.memory.get(reference)
    }

    /// Write an entry; fails on released references
    pub fn set(&mut self, reference: &MemoryRef, value: MemoryValue) -> MemoryResult<()> {
        self.memory.set(reference, value)
    }

    /// Update an entry in place
    pub fn update<F>(&mut self, reference: &MemoryRef, f: F) -> MemoryResult<()>
    where
        F: FnOnce(&mut MemoryValue),
    {
        self.memory.update(reference, f)
    }

    /// Search memory as visible from this block
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<MemoryRef> {
        self.memory
            .search_visible(criteria, self.block.key, self.ancestors())
    }

    /// Register a handler owned by this block.
    ///
    /// Registrations made from a `next` or event call are dropped when that
    /// call's context is disposed; those made during mount live until unmount.
    pub fn subscribe(
        &mut self,
        event_name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: HandlerOptions,
    ) -> HandlerId {
        let id = self
            .events
            .register(event_name, handler, self.block.key, options);
        self.subscriptions.push(id);
        id
    }

    /// Compile a child statement group through the strategy registry
    pub fn compile(&self, statement_ids: &[StatementId]) -> CompileResult<RuntimeBlock> {
        let ctx = CompileContext {
            script: self.script,
            parent: Some(self.block.key),
            depth: self.stack.len(),
        };
        self.compiler.compile(statement_ids, &ctx)
    }

    pub(crate) fn take_subscriptions(&mut self) -> Vec<HandlerId> {
        std::mem::take(&mut self.subscriptions)
    }

    /// Hand long-lived registrations to this context so `dispose` drops them
    pub(crate) fn adopt_subscriptions(&mut self, ids: Vec<HandlerId>) {
        self.subscriptions.extend(ids);
    }

    /// Unregister everything registered through this context
    pub(crate) fn dispose(mut self) {
        for id in self.take_subscriptions() {
            self.events.unregister_by_id(id);
        }
    }
}

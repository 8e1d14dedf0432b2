//! Runtime blocks: composed behaviors driven through a fixed lifecycle
//!
//! A block is the live execution unit for one statement group (or a
//! synthetic root). It owns an ordered behavior list fixed at construction,
//! a fragment store, completion state and timing. Every lifecycle transition
//! runs the same-named hook of all behaviors in list order and concatenates
//! their actions.
//!
//! State machine: `Created -> Mounted -> (next)* -> Unmounted -> Disposed`.
//! Disposal is idempotent and allowed from any state.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ScriptRuntime;
use super::actions::BoxedAction;
use super::behavior::{Behavior, BehaviorContext, LifecycleEnv};
use super::clock::Timestamp;
use super::error::{BehaviorError, BehaviorResult, HandlerResult};
use super::events::{
    EventHandler, HandlerOptions, HandlerScope, NEXT, RuntimeEvent, UNMOUNT,
};
use super::ids::{BlockKey, HandlerId};
use crate::script::{Fragment, FragmentType, StatementId};

/// Lifecycle call in progress, used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// `mount`
    Mount,
    /// `next`
    Next,
    /// `on_event`
    Event,
    /// `unmount`
    Unmount,
    /// `dispose`
    Dispose,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Mount => "mount",
            LifecyclePhase::Next => "next",
            LifecyclePhase::Event => "event",
            LifecyclePhase::Unmount => "unmount",
            LifecyclePhase::Dispose => "dispose",
        };
        f.write_str(name)
    }
}

/// Where a block is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockLifecycle {
    /// Compiled, not yet pushed
    Created,
    /// On the stack
    Mounted,
    /// Popped, awaiting disposal
    Unmounted,
    /// Resources released
    Disposed,
}

/// Start/end instants of a block's time on the stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTiming {
    /// When the block was mounted
    pub start_time: Option<Timestamp>,
    /// When the block was unmounted
    pub end_time: Option<Timestamp>,
}

/// Fragments attached to a block, resolved by origin precedence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentStore {
    fragments: Vec<Fragment>,
}

impl FragmentStore {
    /// Store seeded with `fragments`
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self { fragments }
    }

    /// Append a fragment
    pub fn add(&mut self, fragment: Fragment) {
        self.fragments.push(fragment);
    }

    /// Winning fragment of `kind`: highest origin, latest among equals
    pub fn get(&self, kind: FragmentType) -> Option<&Fragment> {
        self.fragments
            .iter()
            .filter(|f| f.fragment_type() == kind)
            .fold(None, |best: Option<&Fragment>, f| match best {
                Some(b) if b.origin > f.origin => Some(b),
                _ => Some(f),
            })
    }

    /// Every fragment of `kind`, highest precedence first
    pub fn all(&self, kind: FragmentType) -> Vec<&Fragment> {
        let mut found: Vec<&Fragment> = self
            .fragments
            .iter()
            .filter(|f| f.fragment_type() == kind)
            .collect();
        found.sort_by(|a, b| b.origin.cmp(&a.origin));
        found
    }

    /// All fragments in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    /// Owned copy of all fragments
    pub fn to_vec(&self) -> Vec<Fragment> {
        self.fragments.clone()
    }

    /// Number of fragments
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Drop every fragment
    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}

/// Block state visible to behaviors
#[derive(Debug, Clone)]
pub struct BlockCore {
    /// Unique key
    pub key: BlockKey,
    /// Block type chosen by the compiling strategy
    pub block_type: String,
    /// Display label
    pub label: String,
    /// Originating statements
    pub source_ids: Vec<StatementId>,
    /// Fragment store
    pub fragments: FragmentStore,
    /// Mount/unmount instants
    pub timing: ExecutionTiming,
    completion: Option<String>,
}

impl BlockCore {
    /// Fresh core with a new key
    pub fn new(block_type: impl Into<String>, source_ids: Vec<StatementId>) -> Self {
        let block_type = block_type.into();
        Self {
            key: BlockKey::new(),
            label: block_type.clone(),
            block_type,
            source_ids,
            fragments: FragmentStore::default(),
            timing: ExecutionTiming::default(),
            completion: None,
        }
    }

    /// Mark complete; the first reason is kept
    pub fn mark_complete(&mut self, reason: impl Into<String>) {
        if self.completion.is_none() {
            let reason = reason.into();
            tracing::debug!(block = %self.key, block_type = %self.block_type, reason = %reason, "block complete");
            self.completion = Some(reason);
        }
    }

    /// Whether any behavior marked the block complete
    pub fn is_complete(&self) -> bool {
        self.completion.is_some()
    }

    /// Reason recorded with the completion
    pub fn completion_reason(&self) -> Option<&str> {
        self.completion.as_deref()
    }
}

/// Overrides for `mount`
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Explicit start instant instead of the clock
    pub start_time: Option<Timestamp>,
}

/// Overrides for `next`
#[derive(Debug, Clone, Copy, Default)]
pub struct NextOptions {
    /// Explicit instant for the frozen snapshot
    pub now: Option<Timestamp>,
}

/// Overrides for `unmount`
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmountOptions {
    /// Explicit end instant instead of the clock
    pub end_time: Option<Timestamp>,
}

/// An executable block
pub struct RuntimeBlock {
    core: BlockCore,
    behaviors: Vec<Box<dyn Behavior>>,
    lifecycle: BlockLifecycle,
    subscriptions: Vec<HandlerId>,
}

impl fmt::Debug for RuntimeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let behaviors: Vec<&'static str> = self.behaviors.iter().map(|b| b.name()).collect();
        f.debug_struct("RuntimeBlock")
            .field("key", &self.core.key)
            .field("block_type", &self.core.block_type)
            .field("label", &self.core.label)
            .field("source_ids", &self.core.source_ids)
            .field("behaviors", &behaviors)
            .field("lifecycle", &self.lifecycle)
            .field("completion", &self.core.completion)
            .finish()
    }
}

impl RuntimeBlock {
    /// Compose a block from behaviors; the list is fixed from here on
    pub fn new(
        block_type: impl Into<String>,
        source_ids: Vec<StatementId>,
        behaviors: Vec<Box<dyn Behavior>>,
    ) -> Self {
        Self {
            core: BlockCore::new(block_type, source_ids),
            behaviors,
            lifecycle: BlockLifecycle::Created,
            subscriptions: Vec::new(),
        }
    }

    /// Builder-style label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.core.label = label.into();
        self
    }

    /// Builder-style fragments
    pub fn with_fragments(mut self, fragments: Vec<Fragment>) -> Self {
        for fragment in fragments {
            self.core.fragments.add(fragment);
        }
        self
    }

    /// Unique key
    pub fn key(&self) -> BlockKey {
        self.core.key
    }

    /// Block type
    pub fn block_type(&self) -> &str {
        &self.core.block_type
    }

    /// Display label
    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Originating statements
    pub fn source_ids(&self) -> &[StatementId] {
        &self.core.source_ids
    }

    /// Read-only view of the block state
    pub fn core(&self) -> &BlockCore {
        &self.core
    }

    /// Fragment store
    pub fn fragments(&self) -> &FragmentStore {
        &self.core.fragments
    }

    /// Add a fragment (compiler or runtime origin) before or during execution
    pub fn add_fragment(&mut self, fragment: Fragment) {
        self.core.fragments.add(fragment);
    }

    /// Timing
    pub fn timing(&self) -> ExecutionTiming {
        self.core.timing
    }

    /// Lifecycle state
    pub fn lifecycle(&self) -> BlockLifecycle {
        self.lifecycle
    }

    /// Whether the block has been marked complete
    pub fn is_complete(&self) -> bool {
        self.core.is_complete()
    }

    /// Mark the block complete; the stack decides when to pop it
    pub fn mark_complete(&mut self, reason: impl Into<String>) {
        self.core.mark_complete(reason);
    }

    /// Completion reason, if complete
    pub fn completion_reason(&self) -> Option<&str> {
        self.core.completion_reason()
    }

    /// Number of behaviors
    pub fn behavior_count(&self) -> usize {
        self.behaviors.len()
    }

    /// Names of the composed behaviors, in order
    pub fn behavior_names(&self) -> Vec<&'static str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    /// First behavior of concrete type `T`
    pub fn behavior<T: Behavior>(&self) -> Option<&T> {
        self.behaviors.iter().find_map(|b| {
            let any: &dyn Any = b.as_ref();
            any.downcast_ref::<T>()
        })
    }

    /// Handler ids registered for this block's lifetime
    pub fn subscriptions(&self) -> &[HandlerId] {
        &self.subscriptions
    }

    fn ensure_state(&self, phase: LifecyclePhase, expected: BlockLifecycle) -> BehaviorResult<()> {
        if self.lifecycle == expected {
            Ok(())
        } else {
            Err(BehaviorError::failed(
                "lifecycle",
                format!(
                    "cannot {} block {} in state {:?}",
                    phase, self.core.key, self.lifecycle
                ),
            ))
        }
    }

    /// Run every behavior's `on_mount` and register the block's event routes.
    ///
    /// Never pushes or pops; returned actions are executed by the caller.
    pub fn mount(
        &mut self,
        mut env: LifecycleEnv<'_>,
        options: MountOptions,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        self.ensure_state(LifecyclePhase::Mount, BlockLifecycle::Created)?;

        let start = options.start_time.unwrap_or(env.now);
        env.now = start;
        self.core.timing.start_time = Some(start);
        self.lifecycle = BlockLifecycle::Mounted;

        let Self {
            core,
            behaviors,
            subscriptions,
            ..
        } = self;
        let mut ctx = BehaviorContext::new(core, env);

        let mut actions = Vec::new();
        let mut failure = None;
        for behavior in behaviors.iter_mut() {
            match behavior.on_mount(&mut ctx) {
                Ok(produced) => actions.extend(produced),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        ctx.subscribe(
            NEXT,
            Arc::new(BlockEventRoute::new(ctx.key())),
            HandlerOptions::scoped(HandlerScope::Active),
        );

        let route: Arc<dyn EventHandler> = Arc::new(BlockEventRoute::events_only(ctx.key()));

        let mut routed: Vec<(String, HandlerScope)> = Vec::new();
        for behavior in behaviors.iter() {
            for interest in behavior.capabilities().events {
                if interest.event_name == NEXT {
                    continue;
                }
                let entry = (interest.event_name.clone(), interest.scope);
                if routed.contains(&entry) {
                    continue;
                }
                ctx.subscribe(
                    interest.event_name.clone(),
                    route.clone(),
                    HandlerOptions {
                        priority: interest.priority,
                        scope: interest.scope,
                    },
                );
                routed.push(entry);
            }
        }

        subscriptions.extend(ctx.take_subscriptions());

        match failure {
            Some(err) => Err(err),
            None => Ok(actions),
        }
    }

    /// Advance: reset per-call state, then run every behavior's `on_next`
    /// against one frozen-time context that is disposed afterwards.
    pub fn next(
        &mut self,
        mut env: LifecycleEnv<'_>,
        options: NextOptions,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        self.ensure_state(LifecyclePhase::Next, BlockLifecycle::Mounted)?;
        if let Some(now) = options.now {
            env.now = now;
        }

        let Self {
            core, behaviors, ..
        } = self;
        for behavior in behaviors.iter_mut() {
            behavior.prepare();
        }

        let mut ctx = BehaviorContext::new(core, env);
        let result = run_all(behaviors, &mut ctx, true, |b, ctx| b.on_next(ctx));
        ctx.dispose();
        result
    }

    /// Route an event to the behaviors that declared interest in it.
    ///
    /// An unmounted block only accepts the `unmount` lifecycle event.
    pub fn handle_event(
        &mut self,
        env: LifecycleEnv<'_>,
        event: &RuntimeEvent,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        if !(self.lifecycle == BlockLifecycle::Unmounted && event.name == UNMOUNT) {
            self.ensure_state(LifecyclePhase::Event, BlockLifecycle::Mounted)?;
        }

        let Self {
            core, behaviors, ..
        } = self;
        let mut ctx = BehaviorContext::new(core, env);
        let mut actions = Vec::new();
        let mut result = Ok(());
        for behavior in behaviors.iter_mut() {
            if !behavior.capabilities().wants(&event.name) {
                continue;
            }
            match behavior.on_event(event, &mut ctx) {
                Ok(produced) => actions.extend(produced),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        ctx.dispose();
        result.map(|_| actions)
    }

    /// Capture the end time and run every behavior's `on_unmount`. All
    /// behaviors run even if one fails; the first failure is returned.
    ///
    /// The block's event routes stay registered so behaviors can still
    /// receive the `unmount` lifecycle event; `dispose` drops them.
    pub fn unmount(
        &mut self,
        mut env: LifecycleEnv<'_>,
        options: UnmountOptions,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        self.ensure_state(LifecyclePhase::Unmount, BlockLifecycle::Mounted)?;

        let end = options.end_time.unwrap_or(env.now);
        env.now = end;
        self.core.timing.end_time = Some(end);
        self.lifecycle = BlockLifecycle::Unmounted;

        let Self {
            core, behaviors, ..
        } = self;
        let mut ctx = BehaviorContext::new(core, env);
        let result = run_all(behaviors, &mut ctx, false, |b, ctx| b.on_unmount(ctx));
        ctx.dispose();
        result
    }

    /// Run every behavior's `on_dispose` and release block-held resources.
    ///
    /// Safe without a prior mount and idempotent: later calls are no-ops.
    pub fn dispose(&mut self, env: LifecycleEnv<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        if self.lifecycle == BlockLifecycle::Disposed {
            return Ok(Vec::new());
        }
        self.lifecycle = BlockLifecycle::Disposed;

        let Self {
            core,
            behaviors,
            subscriptions,
            ..
        } = self;
        let mut ctx = BehaviorContext::new(core, env);
        let result = run_all(behaviors, &mut ctx, false, |b, ctx| b.on_dispose(ctx));
        ctx.adopt_subscriptions(std::mem::take(subscriptions));
        ctx.dispose();
        self.core.fragments.clear();
        result
    }
}

/// Run `hook` on every behavior in order, concatenating actions.
///
/// With `stop_on_error` the first failure aborts the remaining behaviors;
/// otherwise every behavior runs and the first failure is reported.
fn run_all<F>(
    behaviors: &mut [Box<dyn Behavior>],
    ctx: &mut BehaviorContext<'_>,
    stop_on_error: bool,
    mut hook: F,
) -> BehaviorResult<Vec<BoxedAction>>
where
    F: FnMut(&mut Box<dyn Behavior>, &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>>,
{
    let mut actions = Vec::new();
    let mut first_error = None;
    for behavior in behaviors.iter_mut() {
        match hook(behavior, ctx) {
            Ok(produced) => actions.extend(produced),
            Err(err) => {
                tracing::warn!(behavior = behavior.name(), error = %err, "behavior hook failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
                if stop_on_error {
                    break;
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(actions),
    }
}

/// Handler registered for each mounted block; routes `next` to the block's
/// `next` and every other declared event to its behaviors' `on_event`.
///
/// Only the dedicated `next` registration advances the block. Routes for
/// declared interests, including `*`, deliver every event to `on_event`.
pub struct BlockEventRoute {
    key: BlockKey,
    advances: bool,
}

impl BlockEventRoute {
    /// Route for `key` that advances the block on `next`
    pub fn new(key: BlockKey) -> Self {
        Self {
            key,
            advances: true,
        }
    }

    /// Route for `key` that only delivers events to behaviors
    pub fn events_only(key: BlockKey) -> Self {
        Self {
            key,
            advances: false,
        }
    }
}

impl EventHandler for BlockEventRoute {
    fn name(&self) -> &str {
        "block-route"
    }

    fn handle(
        &self,
        event: &RuntimeEvent,
        runtime: &mut ScriptRuntime,
    ) -> HandlerResult<Vec<BoxedAction>> {
        if self.advances && event.name == NEXT {
            runtime.advance_block(self.key)
        } else {
            runtime.deliver_event(self.key, event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::compiler::JitCompiler;
    use crate::runtime::events::EventBus;
    use crate::runtime::memory::MemoryStore;
    use crate::script::{FragmentOrigin, FragmentValue, WodScript};

    struct Counter {
        mounts: usize,
        nexts: usize,
        disposes: usize,
    }

    impl Behavior for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn on_mount(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
            self.mounts += 1;
            Ok(Vec::new())
        }

        fn on_next(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
            self.nexts += 1;
            if self.nexts == 2 {
                ctx.mark_complete("twice");
            }
            Ok(Vec::new())
        }

        fn on_dispose(&mut self, _ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
            self.disposes += 1;
            Ok(Vec::new())
        }
    }

    struct Harness {
        memory: MemoryStore,
        events: EventBus,
        compiler: JitCompiler,
        script: WodScript,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                memory: MemoryStore::new(),
                events: EventBus::new(),
                compiler: JitCompiler::new(),
                script: WodScript::default(),
            }
        }

        fn env<'a>(&'a mut self, stack: &'a [BlockKey]) -> LifecycleEnv<'a> {
            LifecycleEnv {
                memory: &mut self.memory,
                events: &mut self.events,
                compiler: &self.compiler,
                script: &self.script,
                stack,
                now: crate::runtime::clock::MockClock::epoch(),
            }
        }
    }

    fn counter_block() -> RuntimeBlock {
        RuntimeBlock::new(
            "test",
            vec![1],
            vec![Box::new(Counter {
                mounts: 0,
                nexts: 0,
                disposes: 0,
            })],
        )
    }

    #[test]
    fn test_fragment_precedence() {
        let mut store = FragmentStore::default();
        store.add(Fragment::parsed(FragmentValue::Rep { count: 10 }));
        store.add(Fragment::observed(FragmentValue::Rep { count: 8 }));
        store.add(Fragment::compiled(FragmentValue::Rep { count: 12 }));

        let winner = store.get(FragmentType::Rep).unwrap();
        assert_eq!(winner.origin, FragmentOrigin::Runtime);
        assert_eq!(winner.value, FragmentValue::Rep { count: 8 });

        let origins: Vec<FragmentOrigin> =
            store.all(FragmentType::Rep).iter().map(|f| f.origin).collect();
        assert_eq!(
            origins,
            vec![
                FragmentOrigin::Runtime,
                FragmentOrigin::Compiler,
                FragmentOrigin::Parser
            ]
        );
        assert!(store.get(FragmentType::Timer).is_none());
    }

    #[test]
    fn test_mount_registers_next_route() {
        let mut harness = Harness::new();
        let mut block = counter_block();
        let key = block.key();
        let stack = [key];

        block.mount(harness.env(&stack), MountOptions::default()).unwrap();
        assert_eq!(block.lifecycle(), BlockLifecycle::Mounted);
        assert_eq!(block.subscriptions().len(), 1);
        assert_eq!(harness.events.registrations_for(key).len(), 1);
        assert_eq!(block.behavior::<Counter>().unwrap().mounts, 1);
        assert_eq!(block.timing().start_time, Some(crate::runtime::clock::MockClock::epoch()));
    }

    #[test]
    fn test_next_before_mount_fails() {
        let mut harness = Harness::new();
        let mut block = counter_block();
        let stack: [BlockKey; 0] = [];
        assert!(block.next(harness.env(&stack), NextOptions::default()).is_err());
    }

    #[test]
    fn test_completion_is_advisory() {
        let mut harness = Harness::new();
        let mut block = counter_block();
        let stack = [block.key()];
        block.mount(harness.env(&stack), MountOptions::default()).unwrap();

        block.next(harness.env(&stack), NextOptions::default()).unwrap();
        assert!(!block.is_complete());
        block.next(harness.env(&stack), NextOptions::default()).unwrap();
        assert!(block.is_complete());
        assert_eq!(block.completion_reason(), Some("twice"));

        // still mounted and still accepts next
        block.next(harness.env(&stack), NextOptions::default()).unwrap();
        assert_eq!(block.behavior::<Counter>().unwrap().nexts, 3);
    }

    #[test]
    fn test_routes_outlive_unmount_until_dispose() {
        let mut harness = Harness::new();
        let mut block = counter_block();
        let key = block.key();
        let stack = [key];
        block.mount(harness.env(&stack), MountOptions::default()).unwrap();
        block.unmount(harness.env(&stack), UnmountOptions::default()).unwrap();

        assert!(!harness.events.registrations_for(key).is_empty());
        assert_eq!(block.lifecycle(), BlockLifecycle::Unmounted);
        assert!(block.timing().end_time.is_some());

        block.dispose(harness.env(&stack)).unwrap();
        assert!(harness.events.registrations_for(key).is_empty());
    }

    #[test]
    fn test_dispose_idempotent_without_mount() {
        let mut harness = Harness::new();
        let mut block = counter_block().with_fragments(vec![Fragment::parsed(
            FragmentValue::Rep { count: 5 },
        )]);
        let stack: [BlockKey; 0] = [];

        for _ in 0..5 {
            block.dispose(harness.env(&stack)).unwrap();
        }
        assert_eq!(block.lifecycle(), BlockLifecycle::Disposed);
        assert_eq!(block.behavior::<Counter>().unwrap().disposes, 1);
        assert!(block.fragments().is_empty());
    }
}

//! Runtime stack and push/pop orchestration
//!
//! [`RuntimeStack`] is a flat LIFO of live blocks. The orchestration that
//! surrounds each push and pop (mounting, tracking, releasing memory,
//! dropping handlers, advancing the parent) lives on [`ScriptRuntime`]
//! because it needs every subsystem at once.
//!
//! Push order:
//! 1. validate (depth, duplicate key, lifecycle state) before any mutation
//! 2. `before_push`, with the parent taken from the current top
//! 3. append, then `mount`
//! 4. open the execution record, `after_push`
//! 5. execute the mount actions (a container enters its first child here)
//!
//! Push and pop are refused while an event dispatch is running; handlers
//! request stack changes through returned actions.
//!
//! Pop order:
//! 1. `before_pop`, then `unmount` (failure captured, not returned yet)
//! 2. dispatch the `unmount` lifecycle event and merge its actions
//! 3. remove from the LIFO, close the execution record, `dispose`
//! 4. release owned memory, unregister owned handlers
//! 5. `after_pop`
//! 6. propagate a captured failure, otherwise execute the collected
//!    actions and advance the new top via its `next`

use super::ScriptRuntime;
use super::actions::{ActionDispatcher, ActionPhase, BoxedAction};
use super::behavior::LifecycleEnv;
use super::block::{
    BlockLifecycle, LifecyclePhase, MountOptions, NextOptions, RuntimeBlock, UnmountOptions,
};
use super::clock::Timestamp;
use super::error::{Result, RuntimeError, StackError, StackResult};
use super::events::{EventBus, RuntimeEvent, UNMOUNT};
use super::ids::BlockKey;

/// Hooks around stack mutations and dispatch.
///
/// Injected into the runtime instead of a global logger; every method
/// defaults to a no-op.
pub trait StackObserver: Send + Sync {
    /// A validated block is about to be appended
    fn before_push(&self, _block: &RuntimeBlock, _parent: Option<BlockKey>) {}

    /// A block was appended and mounted
    fn after_push(&self, _block: &RuntimeBlock, _depth: usize) {}

    /// The top block is about to be unmounted
    fn before_pop(&self, _block: &RuntimeBlock) {}

    /// Memory owned by a popped block was released
    fn on_memory_released(&self, _key: BlockKey, _released: usize) {}

    /// Handlers owned by a popped block were unregistered
    fn on_handlers_unregistered(&self, _key: BlockKey, _removed: usize) {}

    /// A block left the stack and its resources are gone
    fn after_pop(&self, _block: &RuntimeBlock, _parent: Option<BlockKey>) {}

    /// An action is about to execute
    fn on_action(&self, _name: &'static str, _phase: ActionPhase) {}

    /// An event finished dispatching
    fn on_event(&self, _event: &RuntimeEvent, _actions: usize) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StackObserver for NoopObserver {}

/// Observer that logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StackObserver for TracingObserver {
    fn before_push(&self, block: &RuntimeBlock, parent: Option<BlockKey>) {
        tracing::debug!(
            block = %block.key(),
            block_type = block.block_type(),
            label = block.label(),
            parent = ?parent,
            "push"
        );
    }

    fn after_push(&self, block: &RuntimeBlock, depth: usize) {
        tracing::trace!(block = %block.key(), depth, "mounted");
    }

    fn before_pop(&self, block: &RuntimeBlock) {
        tracing::debug!(
            block = %block.key(),
            block_type = block.block_type(),
            reason = ?block.completion_reason(),
            "pop"
        );
    }

    fn on_memory_released(&self, key: BlockKey, released: usize) {
        if released > 0 {
            tracing::trace!(block = %key, released, "released memory");
        }
    }

    fn after_pop(&self, block: &RuntimeBlock, parent: Option<BlockKey>) {
        tracing::trace!(block = %block.key(), parent = ?parent, "disposed");
    }

    fn on_action(&self, name: &'static str, phase: ActionPhase) {
        tracing::trace!(action = name, phase = %phase, "action");
    }

    fn on_event(&self, event: &RuntimeEvent, actions: usize) {
        tracing::trace!(event = %event.name, actions, "dispatched");
    }
}

/// LIFO of live blocks
#[derive(Debug)]
pub struct RuntimeStack {
    blocks: Vec<RuntimeBlock>,
    max_depth: usize,
}

impl RuntimeStack {
    /// Empty stack allowing at most `max_depth` blocks
    pub fn new(max_depth: usize) -> Self {
        Self {
            blocks: Vec::new(),
            max_depth,
        }
    }

    /// Configured depth limit
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Check that `block` may be pushed; performs no mutation
    pub fn validate(&self, block: &RuntimeBlock) -> StackResult<()> {
        let depth = self.blocks.len() + 1;
        if depth > self.max_depth {
            return Err(StackError::DepthExceeded {
                max: self.max_depth,
                depth,
            });
        }
        if self.contains(block.key()) {
            return Err(StackError::DuplicateKey(block.key()));
        }
        if block.lifecycle() != BlockLifecycle::Created {
            return Err(StackError::InvalidBlock {
                key: block.key(),
                reason: format!("block is {:?}", block.lifecycle()),
            });
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, block: RuntimeBlock) {
        self.blocks.push(block);
    }

    pub(crate) fn pop(&mut self) -> Option<RuntimeBlock> {
        self.blocks.pop()
    }

    /// Top of the stack
    pub fn current(&self) -> Option<&RuntimeBlock> {
        self.blocks.last()
    }

    /// Key of the top block
    pub fn current_key(&self) -> Option<BlockKey> {
        self.current().map(RuntimeBlock::key)
    }

    /// Block by key
    pub fn get(&self, key: BlockKey) -> Option<&RuntimeBlock> {
        self.blocks.iter().find(|b| b.key() == key)
    }

    pub(crate) fn get_mut(&mut self, key: BlockKey) -> Option<&mut RuntimeBlock> {
        self.blocks.iter_mut().find(|b| b.key() == key)
    }

    /// Whether `key` is on the stack
    pub fn contains(&self, key: BlockKey) -> bool {
        self.blocks.iter().any(|b| b.key() == key)
    }

    /// Keys, root first
    pub fn keys(&self) -> Vec<BlockKey> {
        self.blocks.iter().map(RuntimeBlock::key).collect()
    }

    /// Everything below the top, root first
    pub fn parent_blocks(&self) -> &[RuntimeBlock] {
        match self.blocks.len() {
            0 => &[],
            n => &self.blocks[..n - 1],
        }
    }

    /// All blocks, root first
    pub fn blocks(&self) -> &[RuntimeBlock] {
        &self.blocks
    }

    /// Number of blocks
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the stack is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the complete block closest to the root
    pub fn lowest_complete(&self) -> Option<usize> {
        self.blocks.iter().position(RuntimeBlock::is_complete)
    }
}

impl ScriptRuntime {
    /// Push a block, mounting it at the clock's current time
    pub fn push_block(&mut self, block: RuntimeBlock) -> Result<()> {
        self.push_block_at(block, None)
    }

    /// Push a block, optionally mounting it at an explicit instant.
    ///
    /// Validation errors are returned before the stack is touched. A mount
    /// failure leaves the block on the stack so a later pop cleans it up.
    pub fn push_block_at(&mut self, block: RuntimeBlock, start_time: Option<Timestamp>) -> Result<()> {
        self.ensure_not_dispatching("push")?;
        self.stack.validate(&block)?;

        let parent = self.stack.current_key();
        self.observer.before_push(&block, parent);

        let key = block.key();
        let depth = self.stack.depth();
        self.stack.push(block);

        let mounted = self
            .with_block(key, |block, env| block.mount(env, MountOptions { start_time }))
            .ok_or(StackError::InvalidBlock {
                key,
                reason: "block vanished during push".to_string(),
            })?;

        let now = self.now();
        if let Some(block) = self.stack.get(key) {
            self.tracker.start(block, parent, depth, now);
            self.observer.after_push(block, depth + 1);
        }

        let actions = mounted.map_err(|source| RuntimeError::Lifecycle {
            key,
            phase: LifecyclePhase::Mount,
            source,
        })?;
        ActionDispatcher::execute(self, actions)
    }

    /// Pop the top block and advance its parent.
    ///
    /// Returns `Ok(None)` on an empty stack. An unmount failure is returned
    /// only after dispose, memory release and handler cleanup have run; the
    /// parent is not advanced in that case.
    pub fn pop_block(&mut self) -> Result<Option<BlockKey>> {
        self.pop_block_inner(true)
    }

    pub(crate) fn pop_block_inner(&mut self, advance_parent: bool) -> Result<Option<BlockKey>> {
        self.ensure_not_dispatching("pop")?;
        let Some(current) = self.stack.current() else {
            return Ok(None);
        };
        let key = current.key();
        self.observer.before_pop(current);

        let mut failure = None;
        let mut actions: Vec<BoxedAction> =
            match self.with_block(key, |block, env| block.unmount(env, UnmountOptions::default())) {
                Some(Ok(actions)) => actions,
                Some(Err(source)) => {
                    failure = Some(RuntimeError::Lifecycle {
                        key,
                        phase: LifecyclePhase::Unmount,
                        source,
                    });
                    Vec::new()
                }
                None => Vec::new(),
            };

        let event = RuntimeEvent::new(UNMOUNT).from_block(key).at(self.now());
        actions.extend(EventBus::dispatch(self, &event));

        let found = self.stack.current_key();
        if found != Some(key) {
            return Err(StackError::TopChanged {
                expected: key,
                found,
            }
            .into());
        }
        let Some(mut block) = self.stack.pop() else {
            return Ok(None);
        };
        let now = self.now();
        self.tracker.finish(&block, now);

        let keys = self.stack.keys();
        let env = LifecycleEnv {
            memory: &mut self.memory,
            events: &mut self.events,
            compiler: &*self.compiler,
            script: &*self.script,
            stack: &keys,
            now: self.clock.now(),
        };
        match block.dispose(env) {
            Ok(disposed) => actions.extend(disposed),
            Err(source) if failure.is_none() => {
                failure = Some(RuntimeError::Lifecycle {
                    key,
                    phase: LifecyclePhase::Dispose,
                    source,
                });
            }
            Err(source) => {
                tracing::warn!(block = %key, error = %source, "dispose failed after unmount failure");
            }
        }

        let released = self.memory.release_by_owner(key);
        self.observer.on_memory_released(key, released);
        let removed = self.events.unregister_by_owner(key);
        self.observer.on_handlers_unregistered(key, removed);

        let parent = self.stack.current_key();
        self.observer.after_pop(&block, parent);

        if let Some(err) = failure {
            tracing::warn!(block = %key, error = %err, "pop completed with lifecycle failure");
            return Err(err);
        }

        ActionDispatcher::execute(self, actions)?;

        if advance_parent {
            if let Some(parent) = parent {
                if self.stack.contains(parent) {
                    let actions = self.next_block(parent)?;
                    ActionDispatcher::execute(self, actions)?;
                }
            }
        }

        Ok(Some(key))
    }

    /// Run `next` on a block, mapping failures to lifecycle errors
    pub(crate) fn next_block(&mut self, key: BlockKey) -> Result<Vec<BoxedAction>> {
        match self.with_block(key, |block, env| block.next(env, NextOptions::default())) {
            Some(result) => result.map_err(|source| RuntimeError::Lifecycle {
                key,
                phase: LifecyclePhase::Next,
                source,
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Pop complete blocks until none remain.
    ///
    /// The complete block closest to the root is the target: everything above
    /// it is unwound first without advancing, then the target is popped and
    /// its parent advanced.
    pub(crate) fn sweep_completed(&mut self) -> Result<()> {
        while let Some(target) = self.stack.lowest_complete() {
            while self.stack.depth() > target + 1 {
                self.pop_block_inner(false)?;
            }
            self.pop_block_inner(true)?;
        }

        if self.started && self.stack.is_empty() && self.clock.is_running() {
            let at = self.clock.stop();
            tracing::info!(at = %at, "script complete");
        }
        Ok(())
    }
}

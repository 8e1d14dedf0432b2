//! Event bus with scope- and priority-filtered dispatch
//!
//! Handlers are registered per event name with an owner block, a priority
//! and a scope. Dispatch gathers the handlers for the event name plus the
//! `*` wildcard, keeps those whose scope is satisfied by the current stack,
//! orders them by descending priority (ties by registration order) and
//! collects the actions they return. Dispatch never mutates the stack;
//! returned actions are executed later by the phase-ordered dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ScriptRuntime;
use super::actions::BoxedAction;
use super::clock::Timestamp;
use super::error::HandlerResult;
use super::ids::{BlockKey, HandlerId, IdSequence};

/// Wildcard event name matching every event
pub const WILDCARD: &str = "*";
/// Host "advance" event
pub const NEXT: &str = "next";
/// Host clock tick
pub const TICK: &str = "tick";
/// Lifecycle event emitted while a block unmounts
pub const UNMOUNT: &str = "unmount";
/// A bound timer ran out
pub const TIMER_COMPLETE: &str = "timer:complete";
/// Pause running timers
pub const TIMER_PAUSE: &str = "timer:pause";
/// Resume paused timers
pub const TIMER_RESUME: &str = "timer:resume";

/// An event flowing through the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Event name
    pub name: String,
    /// When the event happened; stamped by the runtime if absent
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    /// Block that raised the event, if any
    #[serde(default)]
    pub source: Option<BlockKey>,
    /// Optional payload
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl RuntimeEvent {
    /// Event with just a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: None,
            source: None,
            data: None,
        }
    }

    /// The host "next" event
    pub fn next() -> Self {
        Self::new(NEXT)
    }

    /// A clock tick
    pub fn tick() -> Self {
        Self::new(TICK)
    }

    /// Attach a source block
    pub fn from_block(mut self, key: BlockKey) -> Self {
        self.source = Some(key);
        self
    }

    /// Attach a payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a timestamp
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Which stack positions the owner must occupy for a handler to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerScope {
    /// Owner must be the top of the stack
    #[default]
    Active,
    /// Owner must be somewhere on the stack
    Bubble,
    /// Always eligible
    Global,
}

impl HandlerScope {
    /// Whether `owner` is eligible given the stack keys (root first)
    pub fn admits(&self, owner: BlockKey, stack: &[BlockKey]) -> bool {
        match self {
            HandlerScope::Global => true,
            HandlerScope::Bubble => stack.contains(&owner),
            HandlerScope::Active => stack.last() == Some(&owner),
        }
    }
}

/// Registration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HandlerOptions {
    /// Higher runs first
    pub priority: i32,
    /// Eligibility scope
    pub scope: HandlerScope,
}

impl HandlerOptions {
    /// Options with an explicit scope and default priority
    pub fn scoped(scope: HandlerScope) -> Self {
        Self { priority: 0, scope }
    }

    /// Builder-style priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Something that reacts to events by returning actions
pub trait EventHandler: Send + Sync {
    /// Handler name for logs
    fn name(&self) -> &str {
        "handler"
    }

    /// React to `event`. Must not mutate the stack directly.
    fn handle(
        &self,
        event: &RuntimeEvent,
        runtime: &mut ScriptRuntime,
    ) -> HandlerResult<Vec<BoxedAction>>;
}

/// Adapter turning a closure into an [`EventHandler`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&RuntimeEvent, &mut ScriptRuntime) -> HandlerResult<Vec<BoxedAction>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(
        &self,
        event: &RuntimeEvent,
        runtime: &mut ScriptRuntime,
    ) -> HandlerResult<Vec<BoxedAction>> {
        (self.f)(event, runtime)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&RuntimeEvent, &mut ScriptRuntime) -> HandlerResult<Vec<BoxedAction>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// One registration in the bus
#[derive(Clone)]
pub struct Registration {
    /// Registration id; also the tie-break order
    pub id: HandlerId,
    /// Owning block
    pub owner: BlockKey,
    /// Event name or `*`
    pub event_name: String,
    /// Priority and scope
    pub options: HandlerOptions,
    handler: Arc<dyn EventHandler>,
}

impl Registration {
    /// The registered handler
    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("event_name", &self.event_name)
            .field("options", &self.options)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Event handler registry and dispatcher
#[derive(Default)]
pub struct EventBus {
    by_event: HashMap<String, Vec<Registration>>,
    event_of: HashMap<HandlerId, String>,
    ids: IdSequence,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns the id used to unregister it
    pub fn register(
        &mut self,
        event_name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        owner: BlockKey,
        options: HandlerOptions,
    ) -> HandlerId {
        let event_name = event_name.into();
        let id = HandlerId(self.ids.next());

        tracing::trace!(
            handler = %id,
            owner = %owner,
            event = %event_name,
            priority = options.priority,
            scope = ?options.scope,
            "register handler"
        );

        self.event_of.insert(id, event_name.clone());
        self.by_event
            .entry(event_name.clone())
            .or_default()
            .push(Registration {
                id,
                owner,
                event_name,
                options,
                handler,
            });
        id
    }

    /// Remove one registration; unknown ids are a no-op
    pub fn unregister_by_id(&mut self, id: HandlerId) -> bool {
        let Some(event_name) = self.event_of.remove(&id) else {
            return false;
        };
        if let Some(list) = self.by_event.get_mut(&event_name) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                self.by_event.remove(&event_name);
            }
        }
        true
    }

    /// Remove every registration owned by `owner`; returns how many were removed
    pub fn unregister_by_owner(&mut self, owner: BlockKey) -> usize {
        let mut removed = Vec::new();
        for list in self.by_event.values_mut() {
            list.retain(|r| {
                if r.owner == owner {
                    removed.push(r.id);
                    false
                } else {
                    true
                }
            });
        }
        self.by_event.retain(|_, list| !list.is_empty());
        for id in &removed {
            self.event_of.remove(id);
        }
        if !removed.is_empty() {
            tracing::debug!(owner = %owner, removed = removed.len(), "unregistered block handlers");
        }
        removed.len()
    }

    /// Whether a registration is still live
    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.event_of.contains_key(&id)
    }

    /// Registrations owned by `owner`, in registration order
    pub fn registrations_for(&self, owner: BlockKey) -> Vec<&Registration> {
        let mut found: Vec<&Registration> = self
            .by_event
            .values()
            .flatten()
            .filter(|r| r.owner == owner)
            .collect();
        found.sort_by_key(|r| r.id);
        found
    }

    /// Total number of live registrations
    pub fn len(&self) -> usize {
        self.event_of.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.event_of.is_empty()
    }

    /// Handlers eligible for `event_name` given the stack (root first),
    /// ordered by descending priority then registration order
    pub fn eligible(&self, event_name: &str, stack: &[BlockKey]) -> Vec<Registration> {
        let mut candidates: Vec<Registration> = self
            .by_event
            .get(WILDCARD)
            .into_iter()
            .flatten()
            .chain(
                (event_name != WILDCARD)
                    .then(|| self.by_event.get(event_name))
                    .flatten()
                    .into_iter()
                    .flatten(),
            )
            .filter(|r| r.options.scope.admits(r.owner, stack))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.options
                .priority
                .cmp(&a.options.priority)
                .then(a.id.cmp(&b.id))
        });
        candidates
    }

    /// Dispatch `event` against the runtime's current stack and collect actions.
    ///
    /// A failing handler is logged and skipped. Dispatch stops early once the
    /// runtime's error list grows during this dispatch; errors recorded before
    /// the dispatch started do not block it. While handlers run, the runtime
    /// refuses direct pushes and pops.
    pub fn dispatch(runtime: &mut ScriptRuntime, event: &RuntimeEvent) -> Vec<BoxedAction> {
        let stack = runtime.stack.keys();
        let handlers = runtime.events.eligible(&event.name, &stack);
        let baseline = runtime.errors().len();
        let mut actions = Vec::new();

        tracing::trace!(event = %event.name, handlers = handlers.len(), "dispatch");

        runtime.dispatch_depth += 1;
        for registration in handlers {
            if !runtime.events.is_registered(registration.id) {
                continue;
            }

            match registration.handler.handle(event, runtime) {
                Ok(produced) => actions.extend(produced),
                Err(err) => {
                    tracing::warn!(
                        event = %event.name,
                        handler = registration.handler.name(),
                        owner = %registration.owner,
                        error = %err,
                        "event handler failed"
                    );
                }
            }

            if runtime.errors().len() > baseline {
                tracing::warn!(
                    event = %event.name,
                    "runtime errors recorded during dispatch, skipping remaining handlers"
                );
                break;
            }
        }
        runtime.dispatch_depth -= 1;

        runtime.observer().on_event(event, actions.len());
        actions
    }
}

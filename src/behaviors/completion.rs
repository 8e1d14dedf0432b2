//! Completion rules

use crate::runtime::actions::BoxedAction;
use crate::runtime::behavior::{Behavior, BehaviorContext, Capabilities};
use crate::runtime::error::BehaviorResult;
use crate::runtime::events::{HandlerScope, RuntimeEvent};

/// Completes the block on the first `next` it receives
#[derive(Debug, Clone, Default)]
pub struct CompleteOnNextBehavior;

impl Behavior for CompleteOnNextBehavior {
    fn name(&self) -> &'static str {
        "complete-on-next"
    }

    fn on_next(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        ctx.mark_complete("user-next");
        Ok(Vec::new())
    }
}

/// Completes the block when a named event reaches it
#[derive(Debug, Clone)]
pub struct CompleteOnEventBehavior {
    event_name: String,
    scope: HandlerScope,
}

impl CompleteOnEventBehavior {
    /// Complete on `event_name`, routed while the block is anywhere on the stack
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            scope: HandlerScope::Bubble,
        }
    }

    /// Override the routing scope
    pub fn with_scope(mut self, scope: HandlerScope) -> Self {
        self.scope = scope;
        self
    }
}

impl Behavior for CompleteOnEventBehavior {
    fn name(&self) -> &'static str {
        "complete-on-event"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().listens(self.event_name.clone(), self.scope)
    }

    fn on_event(
        &mut self,
        event: &RuntimeEvent,
        ctx: &mut BehaviorContext<'_>,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        if event.name == self.event_name {
            ctx.mark_complete(format!("event:{}", event.name));
        }
        Ok(Vec::new())
    }
}

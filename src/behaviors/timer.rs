//! Span-based timers with pause/resume and cooperative expiry
//!
//! Timer spans live in a public `timer` memory entry owned by the block so
//! other behaviors (sound cues, hosts) can read elapsed time. Expiry is
//! checked on each `tick`; there is no preemption.

use chrono::Duration;

use crate::runtime::actions::{BoxedAction, EmitEventAction, EmitOutputAction, SetMemoryAction};
use crate::runtime::behavior::{Behavior, BehaviorContext, Capabilities};
use crate::runtime::clock::{TimeSpan, Timestamp, elapsed, millis, start_span, stop_span};
use crate::runtime::error::{BehaviorError, BehaviorResult, MemoryError};
use crate::runtime::events::{
    HandlerScope, RuntimeEvent, TICK, TIMER_COMPLETE, TIMER_PAUSE, TIMER_RESUME,
};
use crate::runtime::memory::{MemoryRef, MemoryValue, Visibility};
use crate::runtime::tracker::{OutputKind, OutputStatement};
use crate::script::{Fragment, FragmentValue, TimerDirection};

/// Memory type holding a timer's spans
pub const TIMER_MEMORY: &str = "timer";

/// Completion reason set when a bound timer runs out
pub const TIMER_EXPIRED: &str = "timer-expired";

/// Stopwatch or countdown bound to a block
#[derive(Debug, Clone)]
pub struct TimerBehavior {
    duration_ms: Option<u64>,
    direction: TimerDirection,
    spans: Option<MemoryRef>,
    expired: bool,
}

impl TimerBehavior {
    /// Timer that expires after `duration_ms`, or runs unbounded with `None`
    pub fn new(duration_ms: Option<u64>, direction: TimerDirection) -> Self {
        Self {
            duration_ms,
            direction,
            spans: None,
            expired: false,
        }
    }

    /// Countdown from `duration_ms`
    pub fn countdown(duration_ms: u64) -> Self {
        Self::new(Some(duration_ms), TimerDirection::Down)
    }

    /// Unbounded stopwatch
    pub fn stopwatch() -> Self {
        Self::new(None, TimerDirection::Up)
    }

    /// Configured duration
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Whether the timer ran out
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Memory entry holding the spans, once mounted
    pub fn spans_ref(&self) -> Option<&MemoryRef> {
        self.spans.as_ref()
    }

    fn read_spans(&self, ctx: &BehaviorContext<'_>) -> BehaviorResult<Vec<TimeSpan>> {
        let reference = self
            .spans
            .as_ref()
            .ok_or_else(|| BehaviorError::failed("timer", "timer is not mounted"))?;
        match ctx.get(reference) {
            Some(MemoryValue::Spans(spans)) => Ok(spans.clone()),
            Some(_) => Err(MemoryError::TypeMismatch {
                id: reference.id,
                expected: "spans",
            }
            .into()),
            None => Err(MemoryError::UnknownReference(reference.id).into()),
        }
    }

    fn elapsed_at(&self, ctx: &BehaviorContext<'_>, at: Timestamp) -> BehaviorResult<Duration> {
        Ok(elapsed(&self.read_spans(ctx)?, at))
    }

    fn write(&self, spans: Vec<TimeSpan>) -> Vec<BoxedAction> {
        match &self.spans {
            Some(reference) => vec![Box::new(SetMemoryAction::new(
                reference.clone(),
                MemoryValue::Spans(spans),
            ))],
            None => Vec::new(),
        }
    }

    fn on_tick(&mut self, at: Timestamp, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        let Some(duration_ms) = self.duration_ms else {
            return Ok(Vec::new());
        };
        let elapsed = self.elapsed_at(ctx, at)?;
        if elapsed < millis(duration_ms) {
            return Ok(Vec::new());
        }

        self.expired = true;
        ctx.mark_complete(TIMER_EXPIRED);
        tracing::debug!(block = %ctx.key(), duration_ms, "timer expired");

        let mut spans = self.read_spans(ctx)?;
        stop_span(&mut spans, at);

        let mut actions = self.write(spans);
        actions.push(Box::new(EmitOutputAction::new(OutputStatement::notice(
            OutputKind::Milestone,
            ctx.key(),
            TIMER_COMPLETE,
            at,
        ))));
        actions.push(Box::new(EmitEventAction::new(
            RuntimeEvent::new(TIMER_COMPLETE).from_block(ctx.key()).at(at),
        )));
        Ok(actions)
    }
}

impl Behavior for TimerBehavior {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .listens(TICK, HandlerScope::Bubble)
            .listens(TIMER_PAUSE, HandlerScope::Bubble)
            .listens(TIMER_RESUME, HandlerScope::Bubble)
    }

    fn on_mount(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        let mut spans = Vec::new();
        start_span(&mut spans, ctx.now());
        self.spans = Some(ctx.allocate(TIMER_MEMORY, MemoryValue::Spans(spans), Visibility::Public));
        Ok(Vec::new())
    }

    fn on_event(
        &mut self,
        event: &RuntimeEvent,
        ctx: &mut BehaviorContext<'_>,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        if self.expired {
            return Ok(Vec::new());
        }
        let at = event.timestamp.unwrap_or_else(|| ctx.now());

        match event.name.as_str() {
            TICK => self.on_tick(at, ctx),
            TIMER_PAUSE => {
                let mut spans = self.read_spans(ctx)?;
                stop_span(&mut spans, at);
                Ok(self.write(spans))
            }
            TIMER_RESUME => {
                let mut spans = self.read_spans(ctx)?;
                start_span(&mut spans, at);
                Ok(self.write(spans))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn on_unmount(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        let at = ctx.now();
        let mut spans = self.read_spans(ctx)?;
        stop_span(&mut spans, at);
        let observed = elapsed(&spans, at).num_milliseconds().max(0) as u64;

        ctx.add_fragment(Fragment::observed(FragmentValue::Timer {
            duration_ms: Some(observed),
            direction: self.direction,
        }));
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::behavior::LifecycleEnv;
    use crate::runtime::block::{MountOptions, RuntimeBlock, UnmountOptions};
    use crate::runtime::clock::MockClock;
    use crate::runtime::compiler::JitCompiler;
    use crate::runtime::events::EventBus;
    use crate::runtime::ids::BlockKey;
    use crate::runtime::memory::MemoryStore;
    use crate::script::{FragmentType, WodScript};

    struct Env {
        memory: MemoryStore,
        events: EventBus,
        compiler: JitCompiler,
        script: WodScript,
    }

    impl Env {
        fn new() -> Self {
            Self {
                memory: MemoryStore::new(),
                events: EventBus::new(),
                compiler: JitCompiler::new(),
                script: WodScript::default(),
            }
        }

        fn env<'a>(&'a mut self, stack: &'a [BlockKey], now: Timestamp) -> LifecycleEnv<'a> {
            LifecycleEnv {
                memory: &mut self.memory,
                events: &mut self.events,
                compiler: &self.compiler,
                script: &self.script,
                stack,
                now,
            }
        }
    }

    fn names(actions: &[BoxedAction]) -> Vec<&'static str> {
        actions.iter().map(|a| a.name()).collect()
    }

    #[test]
    fn test_tick_before_and_after_expiry() {
        let t0 = MockClock::epoch();
        let mut env = Env::new();
        let mut block = RuntimeBlock::new("timer", Vec::new(), vec![Box::new(TimerBehavior::countdown(60_000))]);
        let stack = [block.key()];
        block.mount(env.env(&stack, t0), MountOptions::default()).unwrap();
        assert_eq!(env.events.registrations_for(block.key()).len(), 4);

        let early = RuntimeEvent::tick().at(t0 + Duration::seconds(30));
        let actions = block.handle_event(env.env(&stack, t0), &early).unwrap();
        assert!(actions.is_empty());
        assert!(!block.is_complete());

        let late = RuntimeEvent::tick().at(t0 + Duration::seconds(60));
        let actions = block.handle_event(env.env(&stack, t0), &late).unwrap();
        assert_eq!(names(&actions), vec!["set-memory", "emit-output", "emit-event"]);
        assert_eq!(block.completion_reason(), Some(TIMER_EXPIRED));
        assert!(block.behavior::<TimerBehavior>().unwrap().is_expired());

        let again = RuntimeEvent::tick().at(t0 + Duration::seconds(61));
        assert!(block.handle_event(env.env(&stack, t0), &again).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_duration_never_expires() {
        let t0 = MockClock::epoch();
        let mut env = Env::new();
        let mut block = RuntimeBlock::new("timer", Vec::new(), vec![Box::new(TimerBehavior::countdown(u64::MAX))]);
        let stack = [block.key()];
        block.mount(env.env(&stack, t0), MountOptions::default()).unwrap();

        let tick = RuntimeEvent::tick().at(t0 + Duration::days(365));
        assert!(block.handle_event(env.env(&stack, t0), &tick).unwrap().is_empty());
        assert!(!block.is_complete());
    }

    #[test]
    fn test_paused_time_not_counted() {
        let t0 = MockClock::epoch();
        let mut env = Env::new();
        let mut block = RuntimeBlock::new("timer", Vec::new(), vec![Box::new(TimerBehavior::stopwatch())]);
        let stack = [block.key()];
        block.mount(env.env(&stack, t0), MountOptions::default()).unwrap();
        let reference = block.behavior::<TimerBehavior>().unwrap().spans_ref().cloned().unwrap();

        // pause at 10s, resume at 25s, unmount at 40s => 25s running
        let mut spans = env.memory.get(&reference).and_then(MemoryValue::as_spans).unwrap().to_vec();
        stop_span(&mut spans, t0 + Duration::seconds(10));
        start_span(&mut spans, t0 + Duration::seconds(25));
        env.memory.set(&reference, MemoryValue::Spans(spans)).unwrap();

        let end = t0 + Duration::seconds(40);
        block.unmount(env.env(&stack, end), UnmountOptions::default()).unwrap();

        let observed = block.fragments().get(FragmentType::Timer).unwrap();
        assert_eq!(
            observed.value,
            FragmentValue::Timer {
                duration_ms: Some(25_000),
                direction: TimerDirection::Up
            }
        );
    }

    #[test]
    fn test_pause_resume_emit_span_writes() {
        let t0 = MockClock::epoch();
        let mut env = Env::new();
        let mut block = RuntimeBlock::new("timer", Vec::new(), vec![Box::new(TimerBehavior::countdown(5_000))]);
        let stack = [block.key()];
        block.mount(env.env(&stack, t0), MountOptions::default()).unwrap();

        let pause = RuntimeEvent::new(TIMER_PAUSE).at(t0 + Duration::seconds(1));
        let actions = block.handle_event(env.env(&stack, t0), &pause).unwrap();
        assert_eq!(names(&actions), vec!["set-memory"]);

        let resume = RuntimeEvent::new(TIMER_RESUME).at(t0 + Duration::seconds(2));
        let actions = block.handle_event(env.env(&stack, t0), &resume).unwrap();
        assert_eq!(names(&actions), vec!["set-memory"]);
    }
}

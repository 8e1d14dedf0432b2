//! Sound cues at mount, unmount and remaining-time thresholds

use serde::{Deserialize, Serialize};

use super::timer::TIMER_MEMORY;
use crate::runtime::actions::{BoxedAction, PlaySoundAction};
use crate::runtime::behavior::{Behavior, BehaviorContext, Capabilities};
use crate::runtime::clock::{elapsed, millis};
use crate::runtime::error::BehaviorResult;
use crate::runtime::events::{HandlerScope, RuntimeEvent, TICK};
use crate::runtime::memory::{MemoryValue, SearchCriteria};

/// When a cue plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundTrigger {
    /// When the block is pushed
    Mount,
    /// When the block's timer has at most this many milliseconds left
    RemainingMs(u64),
    /// When the block is popped
    Unmount,
}

/// One configured cue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundCue {
    /// Trigger
    pub trigger: SoundTrigger,
    /// Sound name handed to the host
    pub sound: String,
}

impl SoundCue {
    /// Cue `sound` on `trigger`
    pub fn new(trigger: SoundTrigger, sound: impl Into<String>) -> Self {
        Self {
            trigger,
            sound: sound.into(),
        }
    }
}

/// Emits [`PlaySoundAction`]s; each cue fires at most once per block
#[derive(Debug, Clone)]
pub struct SoundCueBehavior {
    cues: Vec<SoundCue>,
    duration_ms: Option<u64>,
    fired: Vec<bool>,
}

impl SoundCueBehavior {
    /// Cues for a block whose timer runs `duration_ms` (needed for
    /// remaining-time triggers)
    pub fn new(cues: Vec<SoundCue>, duration_ms: Option<u64>) -> Self {
        let fired = vec![false; cues.len()];
        Self {
            cues,
            duration_ms,
            fired,
        }
    }

    /// Standard countdown cues: start, 3-2-1 beeps, buzzer
    pub fn countdown(duration_ms: u64) -> Self {
        Self::new(
            vec![
                SoundCue::new(SoundTrigger::Mount, "start"),
                SoundCue::new(SoundTrigger::RemainingMs(3_000), "beep"),
                SoundCue::new(SoundTrigger::RemainingMs(2_000), "beep"),
                SoundCue::new(SoundTrigger::RemainingMs(1_000), "beep"),
                SoundCue::new(SoundTrigger::Unmount, "buzzer"),
            ],
            Some(duration_ms),
        )
    }

    /// Configured cues
    pub fn cues(&self) -> &[SoundCue] {
        &self.cues
    }

    fn fire(&mut self, ctx: &BehaviorContext<'_>, matches: impl Fn(&SoundTrigger) -> bool) -> Vec<BoxedAction> {
        let mut actions: Vec<BoxedAction> = Vec::new();
        for (cue, fired) in self.cues.iter().zip(self.fired.iter_mut()) {
            if *fired || !matches(&cue.trigger) {
                continue;
            }
            *fired = true;
            actions.push(Box::new(PlaySoundAction::new(ctx.key(), cue.sound.clone())));
        }
        actions
    }

    fn remaining_ms(&self, ctx: &BehaviorContext<'_>, event: &RuntimeEvent) -> Option<i64> {
        let duration = millis(self.duration_ms?).num_milliseconds();
        let criteria = SearchCriteria::of_type(TIMER_MEMORY).with_owner(ctx.key());
        let reference = ctx.search(&criteria).into_iter().next()?;
        let spans = match ctx.get(&reference)? {
            MemoryValue::Spans(spans) => spans,
            _ => return None,
        };
        let at = event.timestamp.unwrap_or_else(|| ctx.now());
        Some(duration.saturating_sub(elapsed(spans, at).num_milliseconds()))
    }
}

impl Behavior for SoundCueBehavior {
    fn name(&self) -> &'static str {
        "sound-cue"
    }

    fn capabilities(&self) -> Capabilities {
        let timed = self
            .cues
            .iter()
            .any(|c| matches!(c.trigger, SoundTrigger::RemainingMs(_)));
        if timed {
            Capabilities::none().listens(TICK, HandlerScope::Bubble)
        } else {
            Capabilities::none()
        }
    }

    fn on_mount(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        Ok(self.fire(ctx, |t| *t == SoundTrigger::Mount))
    }

    fn on_event(
        &mut self,
        event: &RuntimeEvent,
        ctx: &mut BehaviorContext<'_>,
    ) -> BehaviorResult<Vec<BoxedAction>> {
        let Some(remaining) = self.remaining_ms(ctx, event) else {
            return Ok(Vec::new());
        };
        Ok(self.fire(ctx, |t| match t {
            SoundTrigger::RemainingMs(threshold) => {
                remaining > 0 && remaining <= millis(*threshold).num_milliseconds()
            }
            _ => false,
        }))
    }

    fn on_unmount(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        Ok(self.fire(ctx, |t| *t == SoundTrigger::Unmount))
    }
}

//! Reference behavior library
//!
//! Small composable units the reference strategies assemble into blocks.
//! Each one only depends on the [`Behavior`](crate::runtime::behavior::Behavior)
//! contract and the context it is handed.

pub mod child_runner;
pub mod completion;
pub mod sound;
pub mod timer;

pub use child_runner::{ChildRunnerBehavior, NO_COMPILABLE_CHILDREN, ROUNDS_MEMORY};
pub use completion::{CompleteOnEventBehavior, CompleteOnNextBehavior};
pub use sound::{SoundCue, SoundCueBehavior, SoundTrigger};
pub use timer::{TIMER_EXPIRED, TIMER_MEMORY, TimerBehavior};

//! # Tickloop
//!
//! A phased, fixed-timestep loop scheduler for Rust.
//!
//! Tickloop drives an application's per-frame logic at a fixed update rate,
//! decoupled from the rate it paces frames to. Work is registered as ordered
//! *loop states*, and typed events can be delivered immediately or parked
//! until a chosen phase or loop state has finished.
//!
//! ## Core Concepts
//!
//! - **Phases**: every iteration runs `EarlyUpdate`, `FixedUpdate` (zero or
//!   more times), `Update` and `LateUpdate`, always in that order.
//! - **Loop States**: units of work bound to a phase and ordered by an
//!   engine-priority flag and a sub-priority. States added while the loop
//!   runs are staged and join at the start of the next iteration.
//! - **Accumulator**: real elapsed time is banked and spent in whole fixed
//!   steps of `1 / target_ups` seconds, so simulation speed does not depend
//!   on frame rate.
//! - **Events**: any `'static` type can be an event. Observers subscribe per
//!   type; an optional handler per type can take over fan-out.
//! - **Sync**: when the caller's sync predicate agrees, the loop sleeps out
//!   the remainder of `1 / target_fps`.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tickloop::prelude::*;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Collision { a: u32, b: u32 }
//!
//! fn main() -> anyhow::Result<()> {
//!     let stop = Arc::new(AtomicBool::new(false));
//!     let stop_flag = stop.clone();
//!
//!     // 1. Create the scheduler with a "keep going" and a "pace me" policy.
//!     let scheduler = Scheduler::new(
//!         move |_| !stop_flag.load(Ordering::SeqCst),
//!         |_| true,
//!     );
//!
//!     // 2. Listen for an application event.
//!     scheduler.subscribe(|event: &Collision| println!("collision: {:?}", event));
//!
//!     // 3. Register loop states.
//!     scheduler.add_loop_state(LoopState::new(Phase::FixedUpdate, |ctx, dt| {
//!         // Step physics by `dt`, then report at the end of Update.
//!         let _ = dt;
//!         ctx.scheduler().fire_event_on_phase(Collision { a: 1, b: 2 }, Phase::Update);
//!     }));
//!
//!     // 4. Run. Blocks until `stop` is set.
//!     scheduler.run()?;
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Tickloop";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod common;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod time;

/// A prelude module for easy importing of the most common Tickloop types.
pub mod prelude {
    pub use crate::common::{LoopStateId, ObserverId, Phase};
    pub use crate::components::channel::{ChannelStatus, EventHandler, Observer};
    pub use crate::components::loop_state::{LoopState, LoopStateInfo, StateContext};
    pub use crate::config::{FaultPolicy, SchedulerConfig};
    pub use crate::engine::Scheduler;
    pub use crate::error::TickloopError;
    pub use crate::events::SchedulerEvent;
    pub use crate::time::{ManualTime, MonotonicTime, TimeSource};
}

use anyhow::Result;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tickloop::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A made-up gameplay event used to exercise deferred delivery.
#[derive(Debug, Clone)]
struct Checkpoint {
    step: u64,
    position: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load the configuration, falling back to defaults if the file is absent.
    let config_path = env::args().nth(1).unwrap_or_else(|| "tickloop.toml".to_string());
    let config = SchedulerConfig::load(&config_path)?;
    info!(?config, "Loaded configuration from '{}'.", config_path);

    // 3. Create the scheduler. It keeps running until Ctrl+C flips the flag.
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let pacing = config.sync;
    let scheduler = Scheduler::with_config(
        config,
        move |_| !stop_flag.load(Ordering::SeqCst),
        move |_| pacing,
    )?;

    // 4. Register listeners and loop states.
    register_listeners(&scheduler);
    register_demo_states(&scheduler);

    // 5. Run the loop on a blocking thread and wait for Ctrl+C.
    let loop_handle = scheduler.clone();
    let runner = tokio::task::spawn_blocking(move || loop_handle.run());

    info!(
        "{} v{} running. Press Ctrl+C to shut down.",
        tickloop::ENGINE_NAME,
        tickloop::VERSION
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Stopping the loop...");
    stop.store(true, Ordering::SeqCst);
    scheduler.wake();
    runner.await??;

    Ok(())
}

/// Subscribes to the scheduler's own lifecycle events and the demo event.
fn register_listeners(scheduler: &Scheduler) {
    scheduler.subscribe(|event: &SchedulerEvent| {
        info!("[SCHEDULER] => {:?}", event);
    });

    scheduler.subscribe(|checkpoint: &Checkpoint| {
        info!(
            "[CHECKPOINT] => step {} reached x = {:.2}",
            checkpoint.step, checkpoint.position
        );
    });
}

/// Registers a small simulation: a body moving at constant speed, stepped in
/// FixedUpdate, reported from LateUpdate.
fn register_demo_states(scheduler: &Scheduler) {
    let position_bits = Arc::new(AtomicU64::new(0.0_f64.to_bits()));
    let steps = Arc::new(AtomicU64::new(0));

    // --- Engine-priority input sampling, always first in EarlyUpdate ---
    scheduler.add_loop_state(
        LoopState::new(Phase::EarlyUpdate, |_, _| {})
            .with_engine_priority(true)
            .with_label("input"),
    );

    // --- Fixed-rate integration ---
    let position = position_bits.clone();
    let step_counter = steps.clone();
    scheduler.add_loop_state(
        LoopState::new(Phase::FixedUpdate, move |ctx, _dt| {
            const SPEED: f64 = 2.0;
            let step = ctx.scheduler().fixed_step();
            let x = f64::from_bits(position.load(Ordering::SeqCst)) + SPEED * step;
            position.store(x.to_bits(), Ordering::SeqCst);

            let n = step_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n % u64::from(ctx.scheduler().target_ups()) == 0 {
                ctx.scheduler().fire_event_on_phase(
                    Checkpoint {
                        step: n,
                        position: x,
                    },
                    Phase::LateUpdate,
                );
            }
        })
        .with_label("physics"),
    );

    // --- Frame-rate reporting ---
    let position = position_bits;
    scheduler.add_loop_state(
        LoopState::new(Phase::LateUpdate, move |ctx, _dt| {
            let scheduler = ctx.scheduler();
            let iteration = scheduler.iterations();
            if iteration > 0 && iteration % u64::from(scheduler.target_fps() * 5) == 0 {
                info!(
                    iteration,
                    x = f64::from_bits(position.load(Ordering::SeqCst)),
                    alpha = scheduler.interpolation_alpha(),
                    "[FRAME] status"
                );
            }
        })
        .with_label("reporter"),
    );
}

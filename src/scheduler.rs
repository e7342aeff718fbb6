//! Two independent periodic sweeps (spec.md §4.5/§4.6, §5 "Scheduling
//! model"): analysis every `analysis_period_secs`, execution every
//! `execution_period_secs`. Each tick runs inside its own `tokio::spawn`
//! so a panic during a sweep is caught by the `JoinError` rather than
//! taking the scheduler down with it (spec.md §7 "Scheduler-level panics
//! must be recovered and logged without terminating the scheduler") —
//! the teacher's `worker.rs` isolates per-event failures with a blanket
//! `if let Err(e) = ...`; this extends that discipline to cover panics,
//! which a simple `Result` match cannot catch.

use crate::analysis::AnalysisContext;
use crate::execution::ExecutionContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub async fn run(
    analysis_ctx: Arc<AnalysisContext>,
    execution_ctx: Arc<ExecutionContext>,
    analysis_period: Duration,
    execution_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut analysis_interval = tokio::time::interval(analysis_period);
    let mut execution_interval = tokio::time::interval(execution_period);

    loop {
        tokio::select! {
            // Each tick is spawned and NOT awaited here: the two sweeps must
            // run concurrently with each other (spec.md §5 "cooperative,
            // multi-goroutine" scheduling model), so this loop returns to
            // `select!` immediately rather than blocking the execution timer
            // behind a slow analysis sweep or vice versa. Panics and sweep
            // failures are logged from inside the spawned task itself.
            _ = analysis_interval.tick() => {
                let ctx = analysis_ctx.clone();
                let handle = tokio::spawn(async move { crate::analysis::run_sweep(&ctx).await });
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "analysis sweep aborted"),
                        Err(e) => error!(error = %e, "analysis sweep panicked"),
                    }
                });
            }
            _ = execution_interval.tick() => {
                let ctx = execution_ctx.clone();
                let handle = tokio::spawn(async move { crate::execution::run_tick(ctx).await });
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "execution tick failed"),
                        Err(e) => error!(error = %e, "execution tick panicked"),
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutdown signal received, scheduler exiting cleanly between ticks");
                    break;
                }
            }
        }
    }
}

/// Feeds `true` into the returned receiver's channel on Ctrl-C, letting
/// the scheduler finish its current tick before exiting (spec.md §5
/// "Cancellation & timeout").
pub fn ctrl_c_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}

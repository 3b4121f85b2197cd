//! Polling wait loop shared by every `wait_*` handler.

use std::future::Future;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{Error, Result};
use crate::handlers::{HandlerContext, HandlerOutcome, PollMode};
use crate::types::{Step, StepState};

/// Poll `check` until it reports ready, the wait budget runs out, or the
/// operation's cancellation signal fires.
///
/// The step is put into `waiting` with a human-readable condition before the
/// first check. In single-shot mode exactly one check runs and `Waiting` is
/// returned when it is not yet satisfied; the step-at-a-time executor drives
/// the loop externally by re-invoking the handler.
pub(crate) async fn poll_until<F, Fut>(
    ctx: &mut HandlerContext,
    step: &mut Step,
    condition: &str,
    mut check: F,
) -> Result<HandlerOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    step.wait_condition = Some(condition.to_string());
    step.state = StepState::Waiting;

    if ctx.mode == PollMode::Single {
        return if check().await? {
            step.wait_condition = None;
            Ok(HandlerOutcome::Done)
        } else {
            Ok(HandlerOutcome::Waiting)
        };
    }

    let started = Instant::now();
    let mut ticker = tokio::time::interval(ctx.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cancel_open = true;

    loop {
        if cancel_open {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = ctx.cancel.changed() => {
                    match changed {
                        Ok(()) if *ctx.cancel.borrow() => {
                            debug!(condition = %condition, "Wait cancelled");
                            return Ok(HandlerOutcome::Cancelled);
                        }
                        Ok(()) => continue,
                        // Sender gone; fall back to the ticker alone.
                        Err(_) => {
                            cancel_open = false;
                            continue;
                        }
                    }
                }
            }
        } else {
            ticker.tick().await;
        }

        if ctx.is_cancelled() {
            return Ok(HandlerOutcome::Cancelled);
        }
        if check().await? {
            step.wait_condition = None;
            return Ok(HandlerOutcome::Done);
        }
        if started.elapsed() >= ctx.wait_timeout {
            return Err(Error::WaitTimeout(format!(
                "{condition} (budget {}s exceeded)",
                ctx.wait_timeout.as_secs()
            )));
        }
    }
}

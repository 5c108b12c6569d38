//! Conversation driver: one user utterance in, one assistant reply out.
//!
//! The driver is stateless between calls. Thread continuity relies entirely on the engine's
//! server-side thread state, referenced by the opaque thread id the caller passes back in.
//!
//! # Turn flow
//!
//! 1. Create a thread if none was supplied (retried with backoff on transient failure).
//! 2. Post the user message and start a run.
//! 3. If the engine reports an active run on the thread, fork: create a fresh thread and post
//!    and run there instead. The fork happens at most once per turn.
//! 4. Poll the run until it is terminal or `max_run_wait` elapses.
//! 5. On `completed`, return the latest assistant message verbatim.

use super::engine::{
    EngineError, EngineResult, NewMessage, ReasoningEngine, RunId, RunStatus,
};
use crate::context::CallContext;
use crate::retry::{call_with_retry, CallClass, CallPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use triage_types::{SubjectId, ThreadId};

/// Polling and retry settings for the driver.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub poll_interval: Duration,
    pub max_run_wait: Duration,
    pub calls: CallPolicy,
}

/// Outcome of one driver turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverReply {
    /// Thread the reply was produced on. Differs from the supplied one after a fork.
    pub thread_id: ThreadId,
    /// Assistant text, verbatim.
    pub text: String,
    /// True when the active-run recovery path replaced the caller's thread.
    pub forked: bool,
}

/// Drives a reasoning engine through one turn.
#[derive(Clone)]
pub struct ConversationDriver {
    engine: Arc<dyn ReasoningEngine>,
    cfg: DriverConfig,
}

impl ConversationDriver {
    pub fn new(engine: Arc<dyn ReasoningEngine>, cfg: DriverConfig) -> Self {
        Self { engine, cfg }
    }

    /// Advance the conversation by one user message.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Timeout`] if the run does not finish within `max_run_wait` or a single
    ///   call exceeds its deadline after retries
    /// - [`EngineError::RunActive`] if the forked thread is also busy
    /// - [`EngineError::RunFailed`] / [`EngineError::SafetyFlagged`] if the run ends badly
    /// - [`EngineError::Cancelled`] if the caller cancelled while waiting
    /// - any other engine error from the primitives
    pub async fn advance(
        &self,
        thread_id: Option<ThreadId>,
        subject: &SubjectId,
        message: NewMessage,
        ctx: &CallContext,
    ) -> EngineResult<DriverReply> {
        let thread = match thread_id {
            Some(t) => t,
            None => {
                let t = self.create_thread(ctx).await?;
                info!(
                    thread_id = %t,
                    subject_id = %subject,
                    correlation_id = %ctx.correlation_id,
                    "created conversation thread"
                );
                t
            }
        };

        let (thread, run, forked) = match self.post_and_run(&thread, &message, ctx).await {
            Ok(run) => (thread, run, false),
            Err(EngineError::RunActive { .. }) => {
                let fresh = self.create_thread(ctx).await?;
                warn!(
                    previous_thread_id = %thread,
                    thread_id = %fresh,
                    subject_id = %subject,
                    correlation_id = %ctx.correlation_id,
                    "active run conflict; forking conversation thread"
                );
                let run = self.post_and_run(&fresh, &message, ctx).await?;
                (fresh, run, true)
            }
            Err(e) => return Err(e),
        };

        self.wait_for_run(&thread, &run, ctx).await?;

        let text = call_with_retry(
            &self.cfg.calls,
            CallClass::Read,
            "fetch latest message",
            ctx,
            || self.engine.latest_assistant_message(&thread, ctx),
        )
        .await?;

        debug!(
            thread_id = %thread,
            reply_len = text.len(),
            correlation_id = %ctx.correlation_id,
            "assistant reply received"
        );

        Ok(DriverReply {
            thread_id: thread,
            text,
            forked,
        })
    }

    async fn create_thread(&self, ctx: &CallContext) -> EngineResult<ThreadId> {
        call_with_retry(
            &self.cfg.calls,
            CallClass::Write,
            "create thread",
            ctx,
            || self.engine.create_thread(ctx),
        )
        .await
    }

    async fn post_and_run(
        &self,
        thread: &ThreadId,
        message: &NewMessage,
        ctx: &CallContext,
    ) -> EngineResult<RunId> {
        call_with_retry(
            &self.cfg.calls,
            CallClass::Write,
            "post message",
            ctx,
            || self.engine.post_message(thread, message, ctx),
        )
        .await?;

        call_with_retry(
            &self.cfg.calls,
            CallClass::Write,
            "start run",
            ctx,
            || self.engine.start_run(thread, ctx),
        )
        .await
    }

    async fn wait_for_run(
        &self,
        thread: &ThreadId,
        run: &RunId,
        ctx: &CallContext,
    ) -> EngineResult<()> {
        let deadline = Instant::now() + self.cfg.max_run_wait;

        loop {
            let state = call_with_retry(
                &self.cfg.calls,
                CallClass::Read,
                "poll run status",
                ctx,
                || self.engine.run_state(thread, run, ctx),
            )
            .await?;

            if state.status.is_terminal() {
                return match state.status {
                    RunStatus::Completed => Ok(()),
                    status => match state.last_error {
                        Some(failure) if failure.is_safety_flag() => {
                            Err(EngineError::SafetyFlagged(failure.message))
                        }
                        Some(failure) => Err(EngineError::RunFailed {
                            status,
                            detail: format!("{}: {}", failure.code, failure.message),
                        }),
                        None => Err(EngineError::RunFailed {
                            status,
                            detail: "no error detail reported".into(),
                        }),
                    },
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Timeout {
                    operation: "run completion",
                    after: self.cfg.max_run_wait,
                });
            }

            let pause = self.cfg.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    info!(
                        thread_id = %thread,
                        run_id = %run,
                        correlation_id = %ctx.correlation_id,
                        "caller cancelled; abandoning run polling"
                    );
                    return Err(EngineError::Cancelled("run polling"));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

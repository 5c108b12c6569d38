//! In-process reasoning engine returning queued replies.
//!
//! Used for offline development (`ENGINE_MODE=scripted`) and tests. Behaviour can be primed:
//! active-run conflicts, transient thread-creation failures, runs that never finish, or runs that
//! end in a non-`completed` state.

use super::engine::*;
use crate::context::CallContext;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use triage_types::ThreadId;

/// Reply used when the script runs out.
pub const DEFAULT_SCRIPTED_REPLY: &str =
    "Thank you. Could you tell me more about when the symptoms started and how severe they are?";

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<String>,
    next_thread: u64,
    next_run: u64,
    threads: HashMap<ThreadId, Vec<(String, String)>>,
    runs: HashMap<RunId, RunProgress>,
    conflicts_remaining: u32,
    thread_failures_remaining: u32,
    polls_until_done: u32,
    final_status: Option<RunStatus>,
    never_completes: bool,
    threads_created: u32,
    runs_started: u32,
}

struct RunProgress {
    thread: ThreadId,
    polls_left: u32,
    reply: String,
    finished: bool,
}

/// Scripted reasoning engine.
pub struct ScriptedEngine {
    state: Mutex<ScriptState>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                polls_until_done: 1,
                ..ScriptState::default()
            }),
        }
    }

    /// Queue replies returned by successive runs, in order.
    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().replies.extend(replies.into_iter().map(Into::into));
        self
    }

    /// The next `n` run starts report an active-run conflict.
    pub fn with_active_run_conflicts(self, n: u32) -> Self {
        self.lock().conflicts_remaining = n;
        self
    }

    /// Like [`Self::with_active_run_conflicts`], for an engine already shared with a driver.
    pub fn queue_active_run_conflicts(&self, n: u32) {
        self.lock().conflicts_remaining += n;
    }

    /// The next `n` thread creations fail with a transient error.
    pub fn with_thread_creation_failures(self, n: u32) -> Self {
        self.lock().thread_failures_remaining = n;
        self
    }

    /// Number of status polls before a run reaches its terminal state.
    pub fn with_polls_until_done(self, polls: u32) -> Self {
        self.lock().polls_until_done = polls;
        self
    }

    /// Runs end in `status` instead of `completed`.
    pub fn with_final_status(self, status: RunStatus) -> Self {
        self.lock().final_status = Some(status);
        self
    }

    /// Runs stay `in_progress` forever.
    pub fn never_completing(self) -> Self {
        self.lock().never_completes = true;
        self
    }

    pub fn threads_created(&self) -> u32 {
        self.lock().threads_created
    }

    pub fn runs_started(&self) -> u32 {
        self.lock().runs_started
    }

    /// User messages posted on `thread`, oldest first.
    pub fn user_messages(&self, thread: &ThreadId) -> Vec<String> {
        self.lock()
            .threads
            .get(thread)
            .map(|msgs| {
                msgs.iter()
                    .filter(|(role, _)| role == "user")
                    .map(|(_, text)| text.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        // A poisoned lock only means a test panicked mid-update; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn create_thread(&self, _ctx: &CallContext) -> EngineResult<ThreadId> {
        let mut state = self.lock();
        if state.thread_failures_remaining > 0 {
            state.thread_failures_remaining -= 1;
            return Err(EngineError::Unavailable("scripted outage".into()));
        }
        state.next_thread += 1;
        state.threads_created += 1;
        let id = ThreadId::new(format!("thread_scripted_{}", state.next_thread))
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        state.threads.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn post_message(
        &self,
        thread: &ThreadId,
        message: &NewMessage,
        _ctx: &CallContext,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let messages = state.threads.get_mut(thread).ok_or_else(|| EngineError::Rejected {
            status: 404,
            message: format!("no thread found with id '{thread}'"),
        })?;
        messages.push(("user".into(), message.content.clone()));
        Ok(())
    }

    async fn start_run(&self, thread: &ThreadId, _ctx: &CallContext) -> EngineResult<RunId> {
        let mut state = self.lock();
        if !state.threads.contains_key(thread) {
            return Err(EngineError::Rejected {
                status: 404,
                message: format!("no thread found with id '{thread}'"),
            });
        }
        if state.conflicts_remaining > 0 {
            state.conflicts_remaining -= 1;
            return Err(EngineError::RunActive {
                thread_id: thread.to_string(),
            });
        }

        state.next_run += 1;
        state.runs_started += 1;
        let run = RunId(format!("run_scripted_{}", state.next_run));
        let reply = state
            .replies
            .pop_front()
            .unwrap_or_else(|| DEFAULT_SCRIPTED_REPLY.to_owned());
        let polls_left = state.polls_until_done;
        state.runs.insert(
            run.clone(),
            RunProgress {
                thread: thread.clone(),
                polls_left,
                reply,
                finished: false,
            },
        );
        Ok(run)
    }

    async fn run_state(
        &self,
        thread: &ThreadId,
        run: &RunId,
        _ctx: &CallContext,
    ) -> EngineResult<RunState> {
        let mut state = self.lock();
        let never_completes = state.never_completes;
        let final_status = state.final_status;

        let progress = state
            .runs
            .get_mut(run)
            .filter(|p| &p.thread == thread)
            .ok_or_else(|| EngineError::Rejected {
                status: 404,
                message: format!("no run found with id '{run}'"),
            })?;

        if never_completes {
            return Ok(RunState::new(RunStatus::InProgress));
        }
        if progress.polls_left > 0 {
            progress.polls_left -= 1;
            return Ok(RunState::new(RunStatus::InProgress));
        }

        if let Some(status) = final_status.filter(|s| *s != RunStatus::Completed) {
            return Ok(RunState {
                status,
                last_error: Some(RunFailure {
                    code: "scripted_failure".into(),
                    message: format!("scripted run ended as {status}"),
                }),
            });
        }

        if !progress.finished {
            progress.finished = true;
            let reply = progress.reply.clone();
            let thread = progress.thread.clone();
            if let Some(messages) = state.threads.get_mut(&thread) {
                messages.push(("assistant".into(), reply));
            }
        }
        Ok(RunState::new(RunStatus::Completed))
    }

    async fn latest_assistant_message(
        &self,
        thread: &ThreadId,
        _ctx: &CallContext,
    ) -> EngineResult<String> {
        let state = self.lock();
        state
            .threads
            .get(thread)
            .and_then(|msgs| msgs.iter().rev().find(|(role, _)| role == "assistant"))
            .map(|(_, text)| text.clone())
            .ok_or_else(|| EngineError::NoAssistantMessage {
                thread_id: thread.to_string(),
            })
    }
}

//! Timed Lesson Prompts
//!
//! A lesson carries up to two follow-up prompts, each configured as "seconds
//! remaining" before the lesson ends: a pronunciation warning and an ending
//! warning. The scheduler turns those offsets into waits and issues each
//! prompt to the session once its time comes.
//!
//! The ending wait is measured from the pronunciation step, not from the start
//! of the lesson: `ending_delay - pronunciation_delay`. This keeps the two
//! prompts ordered, and it is applied even when the pronunciation prompt is
//! skipped.
//!
//! A run walks through
//! `Idle → WaitingForPronunciation → WaitingForEnding → Done`, and may stop in
//! `Cancelled` at either wait when the session goes away.

use crate::{
    context::{LessonContext, PromptKind},
    session::SessionHandle,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

/// A prompt that will be sent after waiting `delay_seconds` past the previous step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPrompt {
    pub kind: PromptKind,
    pub delay_seconds: u64,
    pub message: String,
}

/// The waits derived from a lesson context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePlan {
    pub lesson_duration_sec: i64,
    /// Seconds from session start until the pronunciation warning.
    pub pronunciation_delay: i64,
    /// Seconds from session start until the ending warning.
    pub ending_delay: i64,
    pub pronunciation: Option<ScheduledPrompt>,
    pub ending: Option<ScheduledPrompt>,
}

impl SchedulePlan {
    pub fn from_context(context: &LessonContext) -> Self {
        let prompts = &context.timing_prompts;
        let lesson_duration_sec = i64::try_from(context.lesson_duration_sec).unwrap_or(i64::MAX);

        let pronunciation_delay = lesson_duration_sec
            .saturating_sub(prompts.at_sec_remaining(PromptKind::PronunciationWarning));
        let ending_delay =
            lesson_duration_sec.saturating_sub(prompts.at_sec_remaining(PromptKind::EndingWarning));
        let remaining_wait = ending_delay.saturating_sub(pronunciation_delay);

        let prompt = |kind: PromptKind, delay: i64| {
            let message = prompts.message(kind)?;
            let delay_seconds = u64::try_from(delay).ok().filter(|d| *d > 0)?;
            Some(ScheduledPrompt {
                kind,
                delay_seconds,
                message: message.to_string(),
            })
        };

        Self {
            lesson_duration_sec,
            pronunciation_delay,
            ending_delay,
            pronunciation: prompt(PromptKind::PronunciationWarning, pronunciation_delay),
            ending: prompt(PromptKind::EndingWarning, remaining_wait),
        }
    }

    /// The wait between the pronunciation step and the ending warning.
    pub fn remaining_wait(&self) -> i64 {
        self.ending_delay.saturating_sub(self.pronunciation_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    WaitingForPronunciation,
    WaitingForEnding,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Pending,
    Sent,
    Skipped,
    /// The session rejected the prompt; the run carried on.
    Failed,
}

/// What a scheduler run did, returned when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    pub state: SchedulerState,
    pub pronunciation: PromptOutcome,
    pub ending: PromptOutcome,
}

impl Default for ScheduleReport {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            pronunciation: PromptOutcome::Pending,
            ending: PromptOutcome::Pending,
        }
    }
}

pub struct PromptScheduler {
    plan: SchedulePlan,
    session: Arc<dyn SessionHandle>,
    cancel: CancellationToken,
}

impl PromptScheduler {
    pub fn new(
        context: &LessonContext,
        session: Arc<dyn SessionHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plan: SchedulePlan::from_context(context),
            session,
            cancel,
        }
    }

    pub fn plan(&self) -> &SchedulePlan {
        &self.plan
    }

    /// Runs the schedule to completion or until the token is cancelled.
    pub async fn run(self) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        info!(
            pronunciation_delay = self.plan.pronunciation_delay,
            ending_delay = self.plan.ending_delay,
            lesson_duration_sec = self.plan.lesson_duration_sec,
            "Timing prompts scheduled"
        );

        report.state = SchedulerState::WaitingForPronunciation;
        report.pronunciation = match self.step(self.plan.pronunciation.as_ref()).await {
            Some(outcome) => outcome,
            None => return self.cancelled(report),
        };

        report.state = SchedulerState::WaitingForEnding;
        report.ending = match self.step(self.plan.ending.as_ref()).await {
            Some(outcome) => outcome,
            None => return self.cancelled(report),
        };

        report.state = SchedulerState::Done;
        info!(?report, "All timing prompts processed");
        report
    }

    /// Waits for and sends one prompt. `None` means the session went away first.
    async fn step(&self, prompt: Option<&ScheduledPrompt>) -> Option<PromptOutcome> {
        let Some(prompt) = prompt else {
            return Some(PromptOutcome::Skipped);
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            _ = tokio::time::sleep(Duration::from_secs(prompt.delay_seconds)) => {}
        }

        info!(kind = %prompt.kind, "Sending timing prompt");
        // A send still in flight when the session ends is abandoned.
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            sent = self.session.generate_reply(Some(prompt.message.clone())) => sent,
        };
        match sent {
            Ok(()) => Some(PromptOutcome::Sent),
            Err(e) => {
                error!(kind = %prompt.kind, error = ?e, "Failed to send timing prompt");
                Some(PromptOutcome::Failed)
            }
        }
    }

    fn cancelled(&self, mut report: ScheduleReport) -> ScheduleReport {
        info!(after = ?report.state, "Timing prompts cancelled (session ended)");
        report.state = SchedulerState::Cancelled;
        report
    }
}

/// Spawns the timing prompts for `context` as a task bound to `cancel`.
pub fn schedule(
    context: &LessonContext,
    session: Arc<dyn SessionHandle>,
    cancel: CancellationToken,
) -> JoinHandle<ScheduleReport> {
    let scheduler = PromptScheduler::new(context, session, cancel);
    tokio::spawn(scheduler.run().instrument(tracing::info_span!("timing_prompts")))
}

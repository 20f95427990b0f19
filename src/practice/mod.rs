//! Practice runs
//!
//! A recorded take against a question set: camera and microphone are
//! captured while the user works through the questions, and every question
//! change is stamped onto the timeline. The set's time limit finalizes the
//! take when it runs out.

pub mod source;

pub use source::{HttpQuestionSource, QuestionSource};

use crate::capture::{AcquireWarning, DeviceAcquirer};
use crate::recorder::{
    CapturePlan, CaptureSession, CaptureState, MediaRecorder, Recording, RecordingError,
};
use crate::timeline::{Snapshot, TimelineError, TimelineSynchronizer, VisualSurface};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PracticeError {
    #[error("Question set {0} not found")]
    NotFound(String),

    #[error("Failed to fetch question set: {0}")]
    Fetch(String),

    #[error("Question set {0} has no questions")]
    EmptyQuestionSet(String),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),
}

pub type PracticeResult<T> = Result<T, PracticeError>;

/// A single question. Accepts a bare string or `{ "text": ..., "hint": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl<'de> Deserialize<'de> for Question {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Detailed {
                #[serde(alias = "question")]
                text: String,
                #[serde(default)]
                hint: Option<String>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Question { text, hint: None },
            Repr::Detailed { text, hint } => Question { text, hint },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSet {
    pub id: String,
    pub title: String,
    /// Seconds; zero or absent means unlimited
    #[serde(default)]
    pub time_limit: u64,
    pub questions: Vec<Question>,
}

impl QuestionSet {
    pub fn time_limit(&self) -> Option<Duration> {
        (self.time_limit > 0).then(|| Duration::from_secs(self.time_limit))
    }
}

/// Commands accepted by [`PracticeRun::drive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PracticeCommand {
    Advance,
    Pause,
    Resume,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PracticeEnd {
    Finished,
    TimeLimit,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PracticeOutcome {
    pub question_set: QuestionSet,
    pub recording: Recording,
    pub snapshots: Vec<Snapshot>,
}

pub struct PracticeRun {
    question_set: QuestionSet,
    session: CaptureSession,
    timeline: TimelineSynchronizer,
    current: usize,
}

#[cfg(test)]
impl std::fmt::Debug for PracticeRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PracticeRun")
            .field("question_set", &self.question_set)
            .finish_non_exhaustive()
    }
}

impl PracticeRun {
    /// Acquire camera and microphone, start recording and stamp the first
    /// question.
    pub async fn begin(
        question_set: QuestionSet,
        acquirer: &mut DeviceAcquirer,
        recorder: Box<dyn MediaRecorder>,
        surface: Arc<dyn VisualSurface>,
    ) -> PracticeResult<(Self, Vec<AcquireWarning>)> {
        if question_set.questions.is_empty() {
            return Err(PracticeError::EmptyQuestionSet(question_set.id));
        }

        let mut session = CaptureSession::new(recorder);
        let warnings = session
            .acquire(acquirer, &CapturePlan::camera_with_microphone())
            .await?;
        session.start().await?;

        let timeline = TimelineSynchronizer::new(session.handle(), surface);
        let mut run = Self {
            question_set,
            session,
            timeline,
            current: 0,
        };

        if let Err(e) = run.timeline.on_event(0) {
            run.session.abort().await;
            return Err(e.into());
        }

        tracing::info!(
            "Practice run on '{}' started ({} questions)",
            run.question_set.title,
            run.question_set.questions.len()
        );
        Ok((run, warnings))
    }

    pub fn question_set(&self) -> &QuestionSet {
        &self.question_set
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_question(&self) -> &Question {
        &self.question_set.questions[self.current]
    }

    pub fn state(&self) -> CaptureState {
        self.session.state()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        self.timeline.snapshots()
    }

    /// Recording time left, paused time excluded
    pub fn remaining(&self) -> Option<Duration> {
        self.question_set
            .time_limit()
            .map(|limit| limit.saturating_sub(self.session.duration()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Move to the next question.
    ///
    /// Returns `false` on the last question. Outside Recording the index
    /// still moves but no snapshot is taken.
    pub fn advance(&mut self) -> PracticeResult<bool> {
        if self.current + 1 >= self.question_set.questions.len() {
            return Ok(false);
        }

        self.current += 1;
        tracing::debug!("Advanced to question {}", self.current);
        self.timeline.on_event(self.current)?;
        Ok(true)
    }

    pub async fn pause(&mut self) -> PracticeResult<()> {
        Ok(self.session.pause().await?)
    }

    pub async fn resume(&mut self) -> PracticeResult<()> {
        Ok(self.session.resume().await?)
    }

    /// Process commands until finished, the time limit runs out or `cancel`
    /// fires. A closed command channel finishes the run.
    pub async fn drive(
        &mut self,
        mut commands: mpsc::Receiver<PracticeCommand>,
        cancel: &CancellationToken,
    ) -> PracticeResult<PracticeEnd> {
        loop {
            if self.is_expired() {
                tracing::info!("Practice time limit reached");
                return Ok(PracticeEnd::TimeLimit);
            }

            let recording = self.session.state() == CaptureState::Recording;
            let remaining = self.remaining();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PracticeEnd::Cancelled),
                _ = async {
                    match remaining {
                        Some(remaining) => tokio::time::sleep(remaining).await,
                        None => std::future::pending().await,
                    }
                }, if recording => {}
                command = commands.recv() => match command {
                    Some(PracticeCommand::Advance) => {
                        self.advance()?;
                    }
                    Some(PracticeCommand::Pause) => self.pause().await?,
                    Some(PracticeCommand::Resume) => self.resume().await?,
                    Some(PracticeCommand::Finish) | None => return Ok(PracticeEnd::Finished),
                },
            }
        }
    }

    /// Stop recording and hand back the take
    pub async fn finish(mut self) -> PracticeResult<PracticeOutcome> {
        let recording = self.session.stop().await?;

        tracing::info!(
            "Practice run finished: {} snapshots, {}ms",
            self.timeline.snapshots().len(),
            recording.duration.as_millis()
        );

        Ok(PracticeOutcome {
            question_set: self.question_set,
            recording,
            snapshots: self.timeline.into_snapshots(),
        })
    }

    /// Discard the take
    pub async fn cancel(mut self) {
        self.session.abort().await;
    }
}

use crate::export::{EncodingEngine, EngineCommand, EngineOutput, EngineProgress, ExportError, ExportResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    Unavailable,
    Fail(String),
}

/// Output seconds reported before a successful run finishes
const ENCODED_SECONDS: u64 = 3;

/// Encoding engine that writes a placeholder output file.
///
/// A successful run reports one second of encoded output per `step` of
/// wall time and appends to the output file as it goes.
#[derive(Debug)]
pub struct SyntheticEngine {
    behavior: Behavior,
    step: Duration,
    commands: Mutex<Vec<EngineCommand>>,
}

impl SyntheticEngine {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    /// Engine that cannot be loaded
    pub fn unavailable() -> Self {
        Self::with_behavior(Behavior::Unavailable)
    }

    /// Engine that fails every command with `diagnostic`
    pub fn failing(diagnostic: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Fail(diagnostic.into()))
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            step: Duration::from_millis(100),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Time spent encoding each second of output
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn last_command(&self) -> Option<EngineCommand> {
        self.commands.lock().last().cloned()
    }
}

impl Default for SyntheticEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncodingEngine for SyntheticEngine {
    async fn load(&self) -> ExportResult<()> {
        match self.behavior {
            Behavior::Unavailable => Err(ExportError::EngineUnavailable(
                "synthetic engine unavailable".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        command: &EngineCommand,
        on_progress: &(dyn Fn(EngineProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> ExportResult<EngineOutput> {
        self.commands.lock().push(command.clone());

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        match &self.behavior {
            Behavior::Unavailable => Err(ExportError::EngineUnavailable(
                "synthetic engine unavailable".to_string(),
            )),
            Behavior::Fail(diagnostic) => Err(ExportError::EncodingFailed {
                diagnostic: diagnostic.clone(),
            }),
            Behavior::Succeed => {
                let mut output = tokio::fs::File::create(&command.output).await?;
                for secs in 1..=ENCODED_SECONDS {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ExportError::Cancelled),
                        _ = tokio::time::sleep(self.step) => {}
                    }
                    output.write_all(format!("{}s\n", secs).as_bytes()).await?;
                    on_progress(EngineProgress::OutTime(Duration::from_secs(secs)));
                }
                output.write_all(command.graph.to_string().as_bytes()).await?;
                output.flush().await?;
                on_progress(EngineProgress::End);

                Ok(EngineOutput {
                    log: format!("synthetic: {} args", command.to_args().len()),
                })
            }
        }
    }
}

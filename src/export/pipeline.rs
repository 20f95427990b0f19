//! Composition pipeline orchestration
//!
//! Writes the recording and background to a temporary directory, runs the
//! encoding engine and reads the final file back. The temporary directory is
//! removed whether the composition succeeds or fails.

use crate::export::ffmpeg::{EncodingEngine, EngineCommand, EngineProgress};
use crate::export::types::{
    CompositionSpec, EncoderSettings, ExportError, ExportProgress, ExportResult,
};
use crate::recorder::Recording;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The composited output
#[derive(Debug, Clone, PartialEq)]
pub struct FinalFile {
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// Composition stage for finished recordings
pub struct CompositionStage {
    engine: Arc<dyn EncodingEngine>,
    settings: EncoderSettings,
    temp_root: Option<PathBuf>,
}

impl CompositionStage {
    pub fn new(engine: Arc<dyn EncodingEngine>, settings: EncoderSettings) -> Self {
        Self {
            engine,
            settings,
            temp_root: None,
        }
    }

    /// Create working directories under `root` instead of the system temp dir
    pub fn with_temp_root(mut self, root: PathBuf) -> Self {
        self.temp_root = Some(root);
        self
    }

    /// Composite `recording` onto the styled background
    pub async fn compose<F>(
        &self,
        recording: &Recording,
        spec: &CompositionSpec,
        cancel: &CancellationToken,
        progress_callback: F,
    ) -> ExportResult<FinalFile>
    where
        F: Fn(ExportProgress) + Send + Sync,
    {
        let result = self.run(recording, spec, cancel, &progress_callback).await;
        if let Err(e) = &result {
            tracing::error!("Composition failed: {}", e);
            progress_callback(ExportProgress::error(e.to_string()));
        }
        result
    }

    async fn run<F>(
        &self,
        recording: &Recording,
        spec: &CompositionSpec,
        cancel: &CancellationToken,
        progress_callback: &F,
    ) -> ExportResult<FinalFile>
    where
        F: Fn(ExportProgress) + Send + Sync,
    {
        progress_callback(ExportProgress::preparing());

        spec.validate()?;
        let background = spec.background.as_ref().ok_or(ExportError::MissingBackground)?;

        self.engine.load().await?;

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let workdir = match &self.temp_root {
            Some(root) => tempfile::Builder::new().prefix("compose-").tempdir_in(root)?,
            None => tempfile::Builder::new().prefix("mockview-compose-").tempdir()?,
        };

        let input_path = workdir.path().join(format!("input.{}", recording.extension()));
        let background_path = workdir
            .path()
            .join(format!("background.{}", background.extension()));
        let output_path = workdir.path().join("output.mp4");

        tokio::fs::write(&input_path, &recording.data).await?;
        tokio::fs::write(&background_path, &background.data).await?;

        let command = EngineCommand::composition(
            &input_path,
            &background_path,
            spec,
            &self.settings,
            &output_path,
        );

        tracing::info!(
            "Composing recording {} onto {:?} canvas",
            recording.id,
            spec.aspect
        );

        let total_ms = recording.duration.as_millis() as u64;
        let on_progress = |update: EngineProgress| match update {
            EngineProgress::OutTime(out_time) => {
                progress_callback(ExportProgress::encoding(out_time.as_millis() as u64, total_ms));
            }
            EngineProgress::End => {
                progress_callback(ExportProgress::encoding(total_ms, total_ms));
            }
        };

        progress_callback(ExportProgress::encoding(0, total_ms));
        let output = self.engine.execute(&command, &on_progress, cancel).await?;
        tracing::debug!("Engine log: {} bytes", output.log.len());

        progress_callback(ExportProgress::finalizing());

        let data = tokio::fs::read(&output_path).await.map_err(|e| ExportError::EncodingFailed {
            diagnostic: format!("engine produced no output file: {}", e),
        })?;

        let file_name = format!("composed-{}.mp4", recording.id);
        tracing::info!("Composition complete: {} ({} bytes)", file_name, data.len());

        progress_callback(ExportProgress::complete());

        Ok(FinalFile {
            file_name,
            mime_type: "video/mp4".to_string(),
            data: Bytes::from(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::types::{BackgroundImage, ExportStage};
    use crate::synthetic::SyntheticEngine;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recording() -> Recording {
        Recording::from_blob(
            Bytes::from_static(b"recorded"),
            "video/webm",
            Duration::from_secs(8),
        )
    }

    fn styled() -> CompositionSpec {
        CompositionSpec {
            background: Some(BackgroundImage {
                file_name: "office.jpg".to_string(),
                data: Bytes::from_static(b"jpeg"),
            }),
            border: true,
            ..Default::default()
        }
    }

    fn is_empty_dir(path: &std::path::Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_progress_reaches_complete_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(SyntheticEngine::new());
        let stage = CompositionStage::new(engine.clone(), EncoderSettings::default())
            .with_temp_root(root.path().to_path_buf());

        let updates = Mutex::new(Vec::new());
        let file = stage
            .compose(&recording(), &styled(), &CancellationToken::new(), |p| {
                updates.lock().push(p)
            })
            .await
            .unwrap();

        assert_eq!(file.mime_type, "video/mp4");
        assert!(!file.data.is_empty());
        assert!(is_empty_dir(root.path()));

        let updates = updates.into_inner();
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(updates.last().unwrap().stage, ExportStage::Complete);
        assert_eq!(updates.last().unwrap().percent, 100.0);

        let command = engine.last_command().unwrap();
        assert!(command.graph.to_string().contains("drawbox"));
    }

    #[tokio::test]
    async fn test_missing_background() {
        let stage = CompositionStage::new(Arc::new(SyntheticEngine::new()), EncoderSettings::default());
        let spec = CompositionSpec::default();

        let result = stage
            .compose(&recording(), &spec, &CancellationToken::new(), |_| {})
            .await;
        assert_matches!(result, Err(ExportError::MissingBackground));
    }

    #[tokio::test]
    async fn test_engine_unavailable() {
        let stage = CompositionStage::new(
            Arc::new(SyntheticEngine::unavailable()),
            EncoderSettings::default(),
        );

        let result = stage
            .compose(&recording(), &styled(), &CancellationToken::new(), |_| {})
            .await;
        assert_matches!(result, Err(ExportError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn test_encoding_failure_keeps_diagnostic_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let stage = CompositionStage::new(
            Arc::new(SyntheticEngine::failing("Invalid data found when processing input")),
            EncoderSettings::default(),
        )
        .with_temp_root(root.path().to_path_buf());

        let updates = Mutex::new(Vec::new());
        let result = stage
            .compose(&recording(), &styled(), &CancellationToken::new(), |p| {
                updates.lock().push(p)
            })
            .await;

        assert_matches!(
            result,
            Err(ExportError::EncodingFailed { diagnostic }) if diagnostic.contains("Invalid data")
        );
        assert!(is_empty_dir(root.path()));
        assert_matches!(
            updates.into_inner().last().map(|p| p.stage.clone()),
            Some(ExportStage::Error { .. })
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_encoding() {
        let stage = CompositionStage::new(Arc::new(SyntheticEngine::new()), EncoderSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = stage.compose(&recording(), &styled(), &cancel, |_| {}).await;
        assert_matches!(result, Err(ExportError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_encoding_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(SyntheticEngine::new().with_step(Duration::from_secs(1)));
        let stage = CompositionStage::new(engine.clone(), EncoderSettings::default())
            .with_temp_root(root.path().to_path_buf());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let updates = Mutex::new(Vec::new());
        let result = stage
            .compose(&recording(), &styled(), &cancel, |p| updates.lock().push(p))
            .await;

        assert_matches!(result, Err(ExportError::Cancelled));
        assert!(engine.last_command().is_some());
        assert!(is_empty_dir(root.path()));

        let updates = updates.into_inner();
        assert!(updates
            .iter()
            .any(|p| p.stage == ExportStage::Encoding && p.encoded_ms == 1000));
        assert!(updates.iter().all(|p| p.encoded_ms < 2000));
        assert_matches!(updates.last().map(|p| p.stage.clone()), Some(ExportStage::Error { .. }));
    }
}

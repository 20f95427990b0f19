use crate::composer::ComposedStream;
use crate::recorder::{MediaRecorder, RecorderFactory, RecorderOptions, RecordingError, RecordingResult};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Prefix of the first chunk of every synthetic recording
pub const CHUNK_HEADER: &[u8] = b"MVSYNTH1";

#[derive(Debug, Clone, Copy)]
enum Command {
    Pause,
    Resume,
    Stop,
}

/// Emits one chunk per timeslice while recording, plus a final chunk on stop
pub struct SyntheticRecorder {
    options: RecorderOptions,
    recording: Arc<AtomicBool>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl SyntheticRecorder {
    pub fn new(options: RecorderOptions) -> Self {
        Self {
            options,
            recording: Arc::new(AtomicBool::new(false)),
            commands: None,
            task: None,
        }
    }

    fn send(&self, command: Command) -> RecordingResult<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| RecordingError::Recorder("recorder not started".into()))?
            .send(command)
            .map_err(|_| RecordingError::Recorder("recorder task exited".into()))
    }
}

fn chunk(index: u64, stream_id: &uuid::Uuid) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER.len() + 24);
    if index == 0 {
        buf.put_slice(CHUNK_HEADER);
    }
    buf.put_u64(index);
    buf.put_slice(stream_id.as_bytes());
    buf.freeze()
}

#[async_trait]
impl MediaRecorder for SyntheticRecorder {
    fn mime_type(&self) -> &str {
        &self.options.mime_type
    }

    async fn start(&mut self, stream: &ComposedStream) -> RecordingResult<mpsc::UnboundedReceiver<Bytes>> {
        if self.task.is_some() {
            return Err(RecordingError::Recorder("recorder already started".into()));
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let timeslice = self.options.timeslice;
        let stream_id = stream.id();
        let recording = self.recording.clone();

        recording.store(true, Ordering::SeqCst);
        self.commands = Some(command_tx);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut index = 0u64;
            let mut paused = false;

            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(Command::Pause) => paused = true,
                        Some(Command::Resume) => {
                            paused = false;
                            ticker.reset();
                        }
                        Some(Command::Stop) | None => {
                            let _ = chunk_tx.send(chunk(index, &stream_id));
                            break;
                        }
                    },
                    _ = ticker.tick(), if !paused => {
                        if chunk_tx.send(chunk(index, &stream_id)).is_err() {
                            break;
                        }
                        index += 1;
                    }
                }
            }

            recording.store(false, Ordering::SeqCst);
        }));

        tracing::debug!("Synthetic recorder started ({:?} timeslice)", timeslice);
        Ok(chunk_rx)
    }

    async fn pause(&mut self) -> RecordingResult<()> {
        self.send(Command::Pause)?;
        self.recording.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&mut self) -> RecordingResult<()> {
        self.send(Command::Resume)?;
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> RecordingResult<()> {
        self.send(Command::Stop)?;
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| RecordingError::Recorder(format!("recorder task failed: {}", e)))?;
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }
}

impl Drop for SyntheticRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticRecorderFactory;

impl SyntheticRecorderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl RecorderFactory for SyntheticRecorderFactory {
    fn create(&self, options: &RecorderOptions) -> Box<dyn MediaRecorder> {
        Box::new(SyntheticRecorder::new(options.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{LocalTrack, TrackKind, TrackRef};
    use std::time::Duration;

    fn stream() -> ComposedStream {
        let video: TrackRef = Arc::new(LocalTrack::new(TrackKind::Video, "v"));
        let audio: TrackRef = Arc::new(LocalTrack::new(TrackKind::Audio, "a"));
        ComposedStream::direct(vec![video], audio)
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_per_timeslice_and_final_flush() {
        let mut recorder = SyntheticRecorder::new(RecorderOptions::default());
        let mut chunks = recorder.start(&stream()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        recorder.stop().await.unwrap();

        let mut received = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            received.push(chunk);
        }
        assert_eq!(received.len(), 4);
        assert!(received[0].starts_with(CHUNK_HEADER));
        assert!(!received[1].starts_with(CHUNK_HEADER));
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_pause_before_start() {
        let mut recorder = SyntheticRecorder::new(RecorderOptions::default());
        assert!(matches!(
            recorder.pause().await,
            Err(RecordingError::Recorder(_))
        ));
    }
}

//! Software audio mixing graph
//!
//! Every connected audio track gets a source node routed through its own gain
//! node into a single destination. The destination exposes exactly one output
//! track, even when nothing is connected (a silent track).
//!
//! Once started, a mixing task reads the PCM feed of every input, converts it
//! to the format of the first block it sees and publishes mixed blocks on the
//! destination track.

use crate::capture::{AudioBlock, LocalTrack, MediaTrack, TrackKind, TrackRef, AUDIO_FEED_CAPACITY};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Graph node wrapping one input track
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub source_id: Uuid,
    pub track: TrackRef,
}

/// Per-input gain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainNode {
    pub gain: f32,
}

impl Default for GainNode {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

#[derive(Debug, Clone)]
struct MixInput {
    source: SourceNode,
    gain: GainNode,
}

/// N audio sources -> per-source gain -> common destination
#[derive(Debug)]
pub struct MixingGraph {
    inputs: Arc<RwLock<Vec<MixInput>>>,
    destination: Arc<LocalTrack>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl MixingGraph {
    pub fn new() -> Self {
        Self {
            inputs: Arc::new(RwLock::new(Vec::new())),
            destination: Arc::new(LocalTrack::with_feed(TrackKind::Audio, "mixed-audio")),
            tasks: Mutex::new(None),
        }
    }

    /// Route a track into the destination through a unity gain node
    pub fn connect(&mut self, source_id: Uuid, track: TrackRef) {
        tracing::debug!("Mixing {} into destination", track.label());
        self.inputs.write().push(MixInput {
            source: SourceNode { source_id, track },
            gain: GainNode::default(),
        });
    }

    pub fn input_count(&self) -> usize {
        self.inputs.read().len()
    }

    pub fn sources(&self) -> Vec<SourceNode> {
        self.inputs.read().iter().map(|input| input.source.clone()).collect()
    }

    pub fn gain(&self, index: usize) -> Option<GainNode> {
        self.inputs.read().get(index).map(|input| input.gain)
    }

    /// Change an input's gain. Applies to a running mix from the next block.
    pub fn set_gain(&self, index: usize, gain: f32) {
        if let Some(input) = self.inputs.write().get_mut(index) {
            input.gain.gain = gain;
        }
    }

    /// The single output track of the destination
    pub fn output(&self) -> TrackRef {
        self.destination.clone()
    }

    /// Mix one block of PCM samples per input.
    ///
    /// Blocks are matched to inputs by position. Missing or short blocks count
    /// as silence. Output length is the longest block; samples are clamped to
    /// [-1, 1].
    pub fn process(&self, blocks: &[&[f32]]) -> Vec<f32> {
        mix(&self.inputs.read(), blocks)
    }

    /// Start publishing mixed PCM on the output track.
    ///
    /// Returns `false` when no input carries a readable feed; the output then
    /// stays silent. Starting twice is a no-op.
    pub fn start_mixing(&self) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return true;
        }

        let feeds: Vec<(usize, TrackRef, broadcast::Receiver<AudioBlock>)> = self
            .inputs
            .read()
            .iter()
            .enumerate()
            .filter_map(|(index, input)| {
                let track = input.source.track.clone();
                track.audio_feed().map(|feed| (index, track, feed))
            })
            .collect();

        if feeds.is_empty() {
            tracing::debug!("No audio input carries PCM, mix stays silent");
            return false;
        }

        let (tx, rx) = mpsc::channel(AUDIO_FEED_CAPACITY);
        let mut active = vec![false; self.input_count()];
        let mut handles = Vec::with_capacity(feeds.len() + 1);

        for (index, track, feed) in feeds {
            active[index] = true;
            handles.push(tokio::spawn(forward_input(index, track, feed, tx.clone())));
        }
        drop(tx);

        handles.push(tokio::spawn(run_mixer(
            self.inputs.clone(),
            self.destination.clone(),
            active,
            rx,
        )));

        tracing::info!("Mixing {} audio inputs", handles.len() - 1);
        *tasks = Some(handles);
        true
    }

    /// Disconnect every input and end the output track
    pub fn close(&mut self) {
        self.stop_tasks();
        self.inputs.write().clear();
        self.destination.stop();
    }

    fn stop_tasks(&self) {
        if let Some(handles) = self.tasks.lock().take() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

impl Default for MixingGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MixingGraph {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

fn mix(inputs: &[MixInput], blocks: &[&[f32]]) -> Vec<f32> {
    let len = blocks.iter().map(|b| b.len()).max().unwrap_or(0);
    let mut out = vec![0.0f32; len];

    for (input, block) in inputs.iter().zip(blocks) {
        if !input.source.track.is_live() {
            continue;
        }
        for (sample, value) in out.iter_mut().zip(block.iter()) {
            *sample += value * input.gain.gain;
        }
    }

    for sample in &mut out {
        *sample = sample.clamp(-1.0, 1.0);
    }
    out
}

/// Item from an input forwarder; `None` once the input has ended
type InputBlock = (usize, Option<AudioBlock>);

async fn forward_input(
    index: usize,
    track: TrackRef,
    mut feed: broadcast::Receiver<AudioBlock>,
    tx: mpsc::Sender<InputBlock>,
) {
    let mut ended = track.ended();
    loop {
        tokio::select! {
            block = feed.recv() => match block {
                Ok(block) => {
                    if tx.send((index, Some(block))).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Mix input {} dropped {} blocks", index, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = async { let _ = ended.wait_for(|ended| *ended).await; } => break,
        }
    }
    let _ = tx.send((index, None)).await;
}

async fn run_mixer(
    inputs: Arc<RwLock<Vec<MixInput>>>,
    destination: Arc<LocalTrack>,
    mut active: Vec<bool>,
    mut rx: mpsc::Receiver<InputBlock>,
) {
    let mut pending: Vec<VecDeque<f32>> = vec![VecDeque::new(); active.len()];
    let mut format: Option<(u32, u16)> = None;

    while let Some((index, block)) = rx.recv().await {
        match block {
            Some(block) => {
                let (rate, channels) = *format.get_or_insert((block.sample_rate, block.channels));
                if let Some(queue) = pending.get_mut(index) {
                    queue.extend(block.convert(rate, channels));
                }
            }
            None => {
                if let Some(flag) = active.get_mut(index) {
                    *flag = false;
                }
            }
        }

        let Some((rate, channels)) = format else {
            continue;
        };
        let ready = ready_samples(&pending, &active, rate, channels);
        if ready == 0 {
            continue;
        }

        let drained: Vec<Vec<f32>> = pending
            .iter_mut()
            .map(|queue| {
                let n = ready.min(queue.len());
                queue.drain(..n).collect()
            })
            .collect();
        let blocks: Vec<&[f32]> = drained.iter().map(Vec::as_slice).collect();
        let mixed = mix(&inputs.read(), &blocks);

        if !destination.push_audio(AudioBlock::new(rate, channels, mixed)) {
            break;
        }
    }

    tracing::debug!("Mixer stopped");
}

/// Samples every queue can give up for the next mixed block.
///
/// Normally bounded by the shortest live input. An input that has delivered
/// nothing for a fifth of a second is treated as silent so it cannot stall the
/// others.
fn ready_samples(pending: &[VecDeque<f32>], active: &[bool], rate: u32, channels: u16) -> usize {
    let channels = channels.max(1) as usize;
    let most = pending.iter().map(VecDeque::len).max().unwrap_or(0);
    let least = pending
        .iter()
        .zip(active)
        .filter(|(_, active)| **active)
        .map(|(queue, _)| queue.len())
        .min()
        .unwrap_or(most);

    let stall = rate as usize * channels / 5;
    let ready = if least > 0 {
        least
    } else if most >= stall {
        most
    } else {
        0
    };
    ready - ready % channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn audio_track(label: &str) -> TrackRef {
        Arc::new(LocalTrack::new(TrackKind::Audio, label))
    }

    #[test]
    fn test_unity_gain_sum() {
        let mut graph = MixingGraph::new();
        graph.connect(Uuid::new_v4(), audio_track("mic"));
        graph.connect(Uuid::new_v4(), audio_track("system"));

        let mixed = graph.process(&[&[0.25, 0.5], &[0.25, -0.25]]);
        assert_eq!(mixed, vec![0.5, 0.25]);
        assert_eq!(graph.gain(0), Some(GainNode { gain: 1.0 }));
    }

    #[test]
    fn test_clamped_output() {
        let mut graph = MixingGraph::new();
        graph.connect(Uuid::new_v4(), audio_track("a"));
        graph.connect(Uuid::new_v4(), audio_track("b"));

        let mixed = graph.process(&[&[0.8, -0.9], &[0.8, -0.9]]);
        assert_eq!(mixed, vec![1.0, -1.0]);
    }

    #[test]
    fn test_no_inputs_yields_silent_track() {
        let graph = MixingGraph::new();
        assert_eq!(graph.input_count(), 0);
        assert!(graph.output().is_live());
        assert_eq!(graph.output().kind(), TrackKind::Audio);
        assert!(graph.process(&[]).is_empty());
        assert!(!graph.start_mixing());
    }

    #[test]
    fn test_stopped_input_is_silent() {
        let mut graph = MixingGraph::new();
        let mic = audio_track("mic");
        graph.connect(Uuid::new_v4(), mic.clone());
        mic.stop();

        assert_eq!(graph.process(&[&[0.5]]), vec![0.0]);
    }

    #[tokio::test]
    async fn test_live_mix_waits_for_every_input() {
        let mic = Arc::new(LocalTrack::with_feed(TrackKind::Audio, "mic"));
        let system = Arc::new(LocalTrack::with_feed(TrackKind::Audio, "system"));
        let mut graph = MixingGraph::new();
        graph.connect(Uuid::new_v4(), mic.clone());
        graph.connect(Uuid::new_v4(), system.clone());
        graph.set_gain(1, 0.5);

        let mut mixed = graph.output().audio_feed().unwrap();
        assert!(graph.start_mixing());
        assert!(graph.start_mixing());

        mic.push_audio(AudioBlock::new(48_000, 1, vec![0.25; 480]));
        system.push_audio(AudioBlock::new(48_000, 1, vec![0.5; 480]));

        let block = tokio::time::timeout(Duration::from_secs(1), mixed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((block.sample_rate, block.channels), (48_000, 1));
        assert_eq!(block.samples.len(), 480);
        assert!(block.samples.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[tokio::test]
    async fn test_silent_input_does_not_stall_mix() {
        let mic = Arc::new(LocalTrack::with_feed(TrackKind::Audio, "mic"));
        let idle = Arc::new(LocalTrack::with_feed(TrackKind::Audio, "loopback"));
        let mut graph = MixingGraph::new();
        graph.connect(Uuid::new_v4(), mic.clone());
        graph.connect(Uuid::new_v4(), idle);

        let mut mixed = graph.output().audio_feed().unwrap();
        graph.start_mixing();

        for _ in 0..3 {
            mic.push_audio(AudioBlock::new(8_000, 1, vec![0.1; 800]));
        }

        let block = tokio::time::timeout(Duration::from_secs(1), mixed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(block.samples.len() >= 1600);
        assert!((block.samples[0] - 0.1).abs() < 1e-6);

        graph.close();
        assert!(!graph.output().is_live());
    }
}

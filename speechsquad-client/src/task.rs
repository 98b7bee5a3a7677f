//! One paced question stream.
//!
//! A task walks START -> SENDING -> SENDING_COMPLETE -> RECEIVING_COMPLETE.
//! The driver steps it at wall-clock deadlines: the configuration first,
//! then audio slices whose send times are pinned to the real playback rate
//! of the clip. Responses arrive on a separate stream task that fills the
//! shared result record; the record becomes immutable once the state
//! reaches RECEIVING_COMPLETE, which is when the reaper reads it.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Status;
use tracing::debug;

use speechsquad_proto::pb::speech_squad_infer_response::StreamingResponse;
use speechsquad_proto::pb::speech_squad_service_client::SpeechSquadServiceClient;
use speechsquad_proto::pb::{
    AudioConfig, AudioEncoding, SpeechSquadConfig, SpeechSquadInferRequest,
    SpeechSquadInferResponse,
};
use speechsquad_proto::{EXPECTED_TIMING_LABELS, TTS_SAMPLE_RATE_HZ};

use crate::audio::{AudioClip, FIXED_WAV_HEADER_LEN};
use crate::dataset::SquadEvalDataset;
use crate::error::ClientError;
use crate::output::OutputSinks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Start = 0,
    Sending = 1,
    SendingComplete = 2,
    ReceivingComplete = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Start,
            1 => Self::Sending,
            2 => Self::SendingComplete,
            _ => Self::ReceivingComplete,
        }
    }
}

/// Per-stream record shared between the driver, the stream task and the
/// reaper.
#[derive(Debug)]
pub struct TaskResults {
    pub squad_question: String,
    pub squad_answer: String,
    pub audio_content: Vec<u8>,
    /// Milliseconds from the last upload to the first audio response.
    pub response_latency_ms: f64,
    /// Gaps between successive audio responses, milliseconds.
    pub response_intervals_ms: Vec<f64>,
    pub component_timings: HashMap<String, f64>,
    /// True until the first audio response lands.
    pub first_response: bool,
    pub(crate) last_response_at: Option<Instant>,
    /// Timestamp of the most recent send; frozen once sending completes,
    /// so the first-response latency is measured against the final send.
    pub(crate) send_baseline: Option<Instant>,
}

impl TaskResults {
    pub fn new() -> Self {
        Self {
            squad_question: String::new(),
            squad_answer: String::new(),
            audio_content: Vec::new(),
            response_latency_ms: 0.0,
            response_intervals_ms: Vec::new(),
            component_timings: HashMap::new(),
            first_response: true,
            last_response_at: None,
            send_baseline: None,
        }
    }
}

impl Default for TaskResults {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub language_code: String,
    pub chunk_duration_ms: u32,
    pub print_results: bool,
}

/// Bytes of one audio slice at the configured chunk duration.
pub(crate) fn chunk_bytes(sample_rate: u32, chunk_duration_ms: u32) -> usize {
    (sample_rate as usize * chunk_duration_ms as usize / 1000) * std::mem::size_of::<i16>()
}

/// Wall-clock milliseconds of audio a slice represents; header bytes carry
/// no audio time.
pub(crate) fn represented_ms(bytes: usize, header_bytes: usize, sample_rate: u32) -> f64 {
    1000.0 * (bytes - header_bytes) as f64
        / (std::mem::size_of::<i16>() as f64 * sample_rate as f64)
}

struct StreamShared {
    state: Arc<AtomicU8>,
    results: Arc<Mutex<TaskResults>>,
    task_error: Arc<Mutex<Option<ClientError>>>,
    clip: Arc<AudioClip>,
    sinks: Option<Arc<OutputSinks>>,
    keep_audio: bool,
    corr_id: u64,
}

pub struct AudioTask {
    clip: Arc<AudioClip>,
    corr_id: u64,
    dataset: Arc<SquadEvalDataset>,
    settings: TaskSettings,

    offset: usize,
    bytes_to_send: usize,
    next_time_point: Instant,
    audio_processed_secs: f64,

    state: Arc<AtomicU8>,
    results: Arc<Mutex<TaskResults>>,
    task_error: Arc<Mutex<Option<ClientError>>>,

    tx: Option<mpsc::Sender<SpeechSquadInferRequest>>,
    start_signal: Option<oneshot::Sender<()>>,
    completion: Option<JoinHandle<Result<(), Status>>>,
}

impl AudioTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clip: Arc<AudioClip>,
        corr_id: u64,
        channel: Arc<Channel>,
        dataset: Arc<SquadEvalDataset>,
        sinks: Option<Arc<OutputSinks>>,
        settings: TaskSettings,
        scheduled_time: Instant,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let (start_tx, start_rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(TaskState::Start as u8));
        let results = Arc::new(Mutex::new(TaskResults::new()));
        let task_error = Arc::new(Mutex::new(None));

        let shared = StreamShared {
            state: Arc::clone(&state),
            results: Arc::clone(&results),
            task_error: Arc::clone(&task_error),
            clip: Arc::clone(&clip),
            sinks,
            keep_audio: settings.print_results,
            corr_id,
        };
        let completion = tokio::spawn(run_stream(channel, rx, start_rx, shared));

        Self {
            clip,
            corr_id,
            dataset,
            settings,
            offset: 0,
            bytes_to_send: 0,
            next_time_point: scheduled_time,
            audio_processed_secs: 0.0,
            state,
            results,
            task_error,
            tx: Some(tx),
            start_signal: Some(start_tx),
            completion: Some(completion),
        }
    }

    pub fn id(&self) -> u64 {
        self.corr_id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn next_time_point(&self) -> Instant {
        self.next_time_point
    }

    /// Seconds of audio this task has scheduled for upload so far.
    pub fn audio_processed(&self) -> f64 {
        self.audio_processed_secs
    }

    pub fn results(&self) -> Arc<Mutex<TaskResults>> {
        Arc::clone(&self.results)
    }

    pub fn take_error(&self) -> Option<ClientError> {
        self.task_error.lock().take()
    }

    /// Advance the sender: configuration on the first step, then one audio
    /// slice per step, half-closing when the clip is exhausted. The next
    /// deadline moves by exactly the audio duration the slice represents.
    pub async fn step(&mut self) -> Result<(), ClientError> {
        let state = self.state();
        if matches!(state, TaskState::SendingComplete | TaskState::ReceivingComplete) {
            return Err(ClientError::Internal(
                "cannot step further from sending complete".to_string(),
            ));
        }

        self.results.lock().send_baseline = Some(Instant::now());
        debug!("executing step for task {}, state {:?}", self.corr_id, state);

        if state == TaskState::Start {
            let context = self.dataset.question_context(&self.clip.question_id)?;
            let config = SpeechSquadConfig {
                input_audio_config: Some(AudioConfig {
                    encoding: self.clip.encoding as i32,
                    sample_rate_hertz: self.clip.sample_rate as i32,
                    language_code: self.settings.language_code.clone(),
                    audio_channel_count: i32::from(self.clip.channels),
                }),
                output_audio_config: Some(AudioConfig {
                    encoding: AudioEncoding::LinearPcm as i32,
                    sample_rate_hertz: TTS_SAMPLE_RATE_HZ,
                    language_code: "en-US".to_string(),
                    audio_channel_count: 1,
                }),
                squad_context: context.to_string(),
            };
            if self.send(SpeechSquadInferRequest::config(config)).await {
                if let Some(signal) = self.start_signal.take() {
                    let _ = signal.send(());
                }
                let _ = self.state.compare_exchange(
                    TaskState::Start as u8,
                    TaskState::Sending as u8,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            } else {
                self.finish_sending();
                return Ok(());
            }
        } else {
            let end = self.offset + self.bytes_to_send;
            let content = self.clip.data[self.offset..end].to_vec();
            self.offset = end;
            if !self.send(SpeechSquadInferRequest::audio(content)).await {
                self.finish_sending();
                return Ok(());
            }
        }

        // Plan the next slice and its deadline.
        let chunk = chunk_bytes(self.clip.sample_rate, self.settings.chunk_duration_ms);
        let header = if self.offset == 0 { FIXED_WAV_HEADER_LEN } else { 0 };
        self.bytes_to_send = (self.clip.data.len() - self.offset).min(chunk + header);
        if self.bytes_to_send == 0 {
            debug!("sending complete for task {}", self.corr_id);
            self.finish_sending();
        } else {
            let interval_ms = represented_ms(self.bytes_to_send, header, self.clip.sample_rate);
            self.audio_processed_secs += interval_ms / 1000.0;
            self.next_time_point += Duration::from_micros((interval_ms * 1000.0) as u64);
        }
        Ok(())
    }

    /// Block until the stream terminates; the terminal gRPC status becomes
    /// the task's completion status.
    pub async fn wait_for_completion(&mut self) -> Result<(), ClientError> {
        let handle = self
            .completion
            .take()
            .ok_or_else(|| ClientError::Internal("task already awaited".to_string()))?;
        match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(status)) => Err(status.into()),
            Err(join) => Err(ClientError::Internal(format!("stream task failed: {join}"))),
        }
    }

    async fn send(&self, request: SpeechSquadInferRequest) -> bool {
        match &self.tx {
            Some(tx) => {
                if tx.send(request).await.is_err() {
                    debug!("write failed for task {}", self.corr_id);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Half-close the upload. State moves first so a racing completion
    /// cannot be overwritten back to SENDING_COMPLETE.
    fn finish_sending(&mut self) {
        let _ = self.state.compare_exchange(
            TaskState::Sending as u8,
            TaskState::SendingComplete as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        let _ = self.state.compare_exchange(
            TaskState::Start as u8,
            TaskState::SendingComplete as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.start_signal.take();
        self.tx.take();
    }
}

async fn run_stream(
    channel: Arc<Channel>,
    requests: mpsc::Receiver<SpeechSquadInferRequest>,
    started: oneshot::Receiver<()>,
    shared: StreamShared,
) -> Result<(), Status> {
    let outcome = drive_stream(&channel, requests, started, &shared).await;
    shared
        .state
        .store(TaskState::ReceivingComplete as u8, Ordering::Relaxed);
    finalize(&outcome, &shared);
    outcome
}

async fn drive_stream(
    channel: &Channel,
    requests: mpsc::Receiver<SpeechSquadInferRequest>,
    started: oneshot::Receiver<()>,
    shared: &StreamShared,
) -> Result<(), Status> {
    if started.await.is_err() {
        return Err(Status::cancelled("task was never started"));
    }
    let mut client = SpeechSquadServiceClient::new(channel.clone());
    let response = client
        .speech_squad_infer(ReceiverStream::new(requests))
        .await?;
    let mut stream = response.into_inner();
    loop {
        match stream.message().await {
            Ok(Some(response)) => receive_response(response, shared),
            Ok(None) => return Ok(()),
            Err(status) => return Err(status),
        }
    }
}

fn receive_response(response: SpeechSquadInferResponse, shared: &StreamShared) {
    let now = Instant::now();
    let mut results = shared.results.lock();
    debug!("received response for task {}", shared.corr_id);
    match response.streaming_response {
        Some(StreamingResponse::Metadata(meta)) => {
            if meta.component_timing.is_empty() {
                results.squad_question = meta.squad_question;
                results.squad_answer = meta.squad_answer;
            } else {
                for label in EXPECTED_TIMING_LABELS {
                    match meta.component_timing.get(label) {
                        Some(&ms) => {
                            results
                                .component_timings
                                .insert(label.to_string(), f64::from(ms));
                        }
                        None => {
                            *shared.task_error.lock() = Some(ClientError::Internal(format!(
                                "unable to find {label} in the response"
                            )));
                        }
                    }
                }
            }
        }
        Some(StreamingResponse::AudioContent(content)) => {
            if shared.keep_audio {
                results.audio_content.extend_from_slice(&content);
            }
            if results.first_response {
                results.response_latency_ms = results
                    .send_baseline
                    .map(|sent| now.duration_since(sent).as_secs_f64() * 1000.0)
                    .unwrap_or(0.0);
                results.first_response = false;
            } else if let Some(last) = results.last_response_at {
                results
                    .response_intervals_ms
                    .push(now.duration_since(last).as_secs_f64() * 1000.0);
            }
            results.last_response_at = Some(now);
        }
        None => {}
    }
}

fn finalize(outcome: &Result<(), Status>, shared: &StreamShared) {
    debug!(
        "completion for task {}, ok={}",
        shared.corr_id,
        outcome.is_ok()
    );
    if outcome.is_err() {
        print!(".");
        let _ = std::io::stdout().flush();
        return;
    }
    match &shared.sinks {
        Some(sinks) => {
            let results = shared.results.lock();
            if let Err(e) = sinks.record(&shared.clip, &results) {
                *shared.task_error.lock() = Some(e);
            }
        }
        None => {
            print!(".");
            let _ = std::io::stdout().flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_bytes_matches_real_time() {
        // 16 kHz, 800 ms -> 12800 samples -> 25600 bytes
        assert_eq!(chunk_bytes(16000, 800), 25600);
        assert_eq!(chunk_bytes(8000, 100), 1600);
    }

    #[test]
    fn test_represented_ms_ignores_header_bytes() {
        // a full 800 ms chunk at 16 kHz
        let ms = represented_ms(25600, 0, 16000);
        assert!((ms - 800.0).abs() < 1e-9);
        // same chunk with the 44-byte header attached represents the same time
        let ms = represented_ms(25600 + FIXED_WAV_HEADER_LEN, FIXED_WAV_HEADER_LEN, 16000);
        assert!((ms - 800.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            TaskState::Start,
            TaskState::Sending,
            TaskState::SendingComplete,
            TaskState::ReceivingComplete,
        ] {
            assert_eq!(TaskState::from_u8(state as u8), state);
        }
    }
}

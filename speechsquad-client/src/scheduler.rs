//! Load driver and reaper.
//!
//! The driver keeps at most P tasks in flight across two buckets, stepping
//! each task once its wall-clock deadline arrives. Completed senders are
//! handed to the reaper, which blocks on each stream's terminal status and
//! folds the per-task records into the run statistics. With true
//! concurrency a slot is occupied until the stream fully terminates;
//! otherwise it frees as soon as the upload completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use crate::audio::AudioClip;
use crate::channels::ChannelSet;
use crate::dataset::SquadEvalDataset;
use crate::error::ClientError;
use crate::output::OutputSinks;
use crate::task::{AudioTask, TaskSettings, TaskState};

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub num_parallel_requests: usize,
    /// Stagger between successive stream launches, microseconds.
    pub offset_duration_us: u64,
    pub true_concurrency: bool,
    /// Rank of this process; the very first fill staggers peers by rank.
    pub proc_index: usize,
    pub task_settings: TaskSettings,
}

#[derive(Debug, Default)]
pub struct LoadStats {
    pub response_latencies_ms: Vec<f64>,
    pub component_timings_ms: HashMap<String, Vec<f64>>,
    pub total_audio_secs: f64,
    pub failed_tasks: u64,
    pub completed_tasks: u64,
}

/// Issue every clip as one stream and collect the run statistics. The
/// reaper always drains every issued task, so audio totals and failure
/// counts are correct even when the driver aborts.
pub async fn run_load(
    clips: Vec<Arc<AudioClip>>,
    channels: Arc<ChannelSet>,
    dataset: Arc<SquadEvalDataset>,
    sinks: Option<Arc<OutputSinks>>,
    config: LoadConfig,
) -> Result<LoadStats, ClientError> {
    let (queue_tx, queue_rx) = mpsc::channel(config.num_parallel_requests.max(1));
    let reaper = tokio::spawn(reap(queue_rx));
    let drive_result = drive(&clips, &channels, &dataset, &sinks, &config, &queue_tx).await;
    drop(queue_tx);
    let stats = reaper
        .await
        .map_err(|e| ClientError::Internal(format!("reaper failed: {e}")))?;
    drive_result?;
    Ok(stats)
}

async fn drive(
    clips: &[Arc<AudioClip>],
    channels: &ChannelSet,
    dataset: &Arc<SquadEvalDataset>,
    sinks: &Option<Arc<OutputSinks>>,
    config: &LoadConfig,
    queue: &mpsc::Sender<AudioTask>,
) -> Result<(), ClientError> {
    let parallel = config.num_parallel_requests.max(1);
    let offset = Duration::from_micros(config.offset_duration_us);
    let mut curr: Vec<AudioTask> = Vec::with_capacity(parallel);
    let mut next: Vec<AudioTask> = Vec::with_capacity(parallel);
    let mut clip_index = 0usize;

    loop {
        // Refill free slots; the very first fill staggers by process rank.
        let mut offset_index = if clip_index == 0 { config.proc_index } else { 0 };
        let now = Instant::now();
        while curr.len() < parallel && clip_index < clips.len() {
            debug!("adding a new task with id {clip_index}");
            let scheduled = now + offset * offset_index as u32;
            offset_index += 1;
            curr.push(AudioTask::new(
                Arc::clone(&clips[clip_index]),
                clip_index as u64,
                channels.pick(),
                Arc::clone(dataset),
                sinks.clone(),
                config.task_settings.clone(),
                scheduled,
            ));
            clip_index += 1;
        }
        if curr.is_empty() {
            break;
        }

        for mut task in curr.drain(..) {
            if Instant::now() < task.next_time_point() {
                next.push(task);
                continue;
            }
            if matches!(task.state(), TaskState::Start | TaskState::Sending) {
                task.step().await?;
            }
            let hand_off = match task.state() {
                TaskState::ReceivingComplete => true,
                TaskState::SendingComplete => !config.true_concurrency,
                _ => false,
            };
            if hand_off {
                queue
                    .send(task)
                    .await
                    .map_err(|_| ClientError::Internal("reaper queue closed".to_string()))?;
            } else {
                next.push(task);
            }
        }
        std::mem::swap(&mut curr, &mut next);

        // Sleep to the earliest upcoming send deadline; when only waiting on
        // stream completions, poll on a short tick instead.
        let earliest = curr
            .iter()
            .filter(|t| matches!(t.state(), TaskState::Start | TaskState::Sending))
            .map(AudioTask::next_time_point)
            .min();
        match earliest {
            Some(deadline) => {
                if deadline > Instant::now() {
                    tokio::time::sleep_until(deadline.into()).await;
                }
            }
            None => {
                if !curr.is_empty() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
    }
    Ok(())
}

/// Sequentially await every handed-off task. Statistics are only recorded
/// for streams that actually received audio; failures are always counted.
async fn reap(mut queue: mpsc::Receiver<AudioTask>) -> LoadStats {
    let mut stats = LoadStats::default();
    while let Some(mut task) = queue.recv().await {
        let grpc_result = task.wait_for_completion().await;
        stats.total_audio_secs += task.audio_processed();
        stats.completed_tasks += 1;

        let task_error = task.take_error();
        let failed = grpc_result.is_err() || task_error.is_some();
        if let Err(e) = &grpc_result {
            debug!("task {} failed: {e}", task.id());
        } else if let Some(e) = &task_error {
            debug!("task {} failed: {e}", task.id());
        }
        if failed {
            stats.failed_tasks += 1;
            continue;
        }

        let results = task.results();
        let results = results.lock();
        if !results.first_response {
            stats.response_latencies_ms.push(results.response_latency_ms);
            for (label, &ms) in &results.component_timings {
                stats
                    .component_timings_ms
                    .entry(label.clone())
                    .or_default()
                    .push(ms);
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_clip;

    use speechsquad_proto::pb::speech_squad_infer_request::StreamingRequest;
    use speechsquad_proto::pb::speech_squad_service_server::{
        SpeechSquadService, SpeechSquadServiceServer,
    };
    use speechsquad_proto::pb::{
        SpeechSquadInferRequest, SpeechSquadInferResponse, SpeechSquadResponseMeta,
    };
    use speechsquad_proto::EXPECTED_TIMING_LABELS;
    use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
    use tonic::{Request, Response, Status, Streaming};

    /// Minimal stand-in for the squad service: drains the upload, then
    /// emits metadata, two audio frames and the trailing timing map.
    struct MockSquad {
        fail: bool,
    }

    #[tonic::async_trait]
    impl SpeechSquadService for MockSquad {
        type SpeechSquadInferStream = ReceiverStream<Result<SpeechSquadInferResponse, Status>>;

        async fn speech_squad_infer(
            &self,
            request: Request<Streaming<SpeechSquadInferRequest>>,
        ) -> Result<Response<Self::SpeechSquadInferStream>, Status> {
            let mut inbound = request.into_inner();
            let fail = self.fail;
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            tokio::spawn(async move {
                let mut saw_config = false;
                while let Ok(Some(request)) = inbound.message().await {
                    if matches!(
                        request.streaming_request,
                        Some(StreamingRequest::SpeechSquadConfig(_))
                    ) {
                        saw_config = true;
                    }
                }
                if fail {
                    let _ = tx.send(Err(Status::internal("synthetic failure"))).await;
                    return;
                }
                assert!(saw_config, "client must send a configuration first");
                let meta = SpeechSquadResponseMeta {
                    squad_question: "why is the sky blue?".to_string(),
                    squad_answer: "rayleigh scattering".to_string(),
                    ..Default::default()
                };
                let _ = tx.send(Ok(SpeechSquadInferResponse::metadata(meta))).await;
                let _ = tx.send(Ok(SpeechSquadInferResponse::audio(vec![0u8; 1024]))).await;
                let _ = tx.send(Ok(SpeechSquadInferResponse::audio(vec![0u8; 1024]))).await;
                let mut timing = SpeechSquadResponseMeta::default();
                for label in EXPECTED_TIMING_LABELS {
                    timing.component_timing.insert(label.to_string(), 5.0);
                }
                let _ = tx.send(Ok(SpeechSquadInferResponse::metadata(timing))).await;
            });
            Ok(Response::new(ReceiverStream::new(rx)))
        }
    }

    async fn spawn_mock(fail: bool) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(SpeechSquadServiceServer::new(MockSquad { fail }))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        format!("127.0.0.1:{}", addr.port())
    }

    fn config(parallel: usize, chunk_ms: u32) -> LoadConfig {
        LoadConfig {
            num_parallel_requests: parallel,
            offset_duration_us: chunk_ms as u64 * 1000 / parallel as u64,
            true_concurrency: true,
            proc_index: 0,
            task_settings: TaskSettings {
                language_code: "en-US".to_string(),
                chunk_duration_ms: chunk_ms,
                print_results: false,
            },
        }
    }

    fn dataset() -> Arc<SquadEvalDataset> {
        Arc::new(SquadEvalDataset::for_tests(&[
            ("q1", "why is the sky blue", "the sky is blue because of rayleigh scattering"),
            ("q2", "what scatters light", "the sky is blue because of rayleigh scattering"),
        ]))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_run_records_stats() {
        let uri = spawn_mock(false).await;
        let channels = Arc::new(ChannelSet::connect(&uri, 1).await.unwrap());
        let clips = vec![test_clip("q1", 300), test_clip("q2", 300), test_clip("q1", 300)];

        let stats = run_load(clips, channels, dataset(), None, config(2, 100))
            .await
            .unwrap();

        assert_eq!(stats.completed_tasks, 3);
        assert_eq!(stats.failed_tasks, 0);
        assert_eq!(stats.response_latencies_ms.len(), 3);
        assert_eq!(stats.component_timings_ms.len(), EXPECTED_TIMING_LABELS.len());
        for label in EXPECTED_TIMING_LABELS {
            assert_eq!(stats.component_timings_ms[label].len(), 3, "{label}");
        }
        assert!((stats.total_audio_secs - 0.9).abs() < 1e-6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pacing_holds_streams_to_real_time() {
        let uri = spawn_mock(false).await;
        let channels = Arc::new(ChannelSet::connect(&uri, 1).await.unwrap());
        let clips = vec![test_clip("q1", 600)];

        let start = Instant::now();
        let stats = run_load(clips, channels, dataset(), None, config(1, 100))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(stats.failed_tasks, 0);
        // uploading 600 ms of audio at the real playback rate cannot finish
        // faster than the audio itself (minus scheduler noise)
        assert!(
            elapsed >= Duration::from_millis(500),
            "finished in {elapsed:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_streams_are_counted_not_fatal() {
        let uri = spawn_mock(true).await;
        let channels = Arc::new(ChannelSet::connect(&uri, 1).await.unwrap());
        let clips = vec![test_clip("q1", 200), test_clip("q2", 200)];

        let stats = run_load(clips, channels, dataset(), None, config(2, 100))
            .await
            .unwrap();

        assert_eq!(stats.completed_tasks, 2);
        assert_eq!(stats.failed_tasks, 2);
        assert!(stats.response_latencies_ms.is_empty());
        // audio totals still accumulate for failed streams
        assert!(stats.total_audio_secs > 0.0);
    }
}

//! End-to-end scenarios: the real orchestration server over localhost TCP
//! against in-process mock ASR/NLP/TTS services.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Endpoint, Server};
use tonic::{Request, Response, Status, Streaming};

use speechsquad_proto::pb::speech_squad_service_client::SpeechSquadServiceClient;
use speechsquad_proto::pb::{
    asr_server::{Asr, AsrServer},
    nlp_server::{Nlp, NlpServer},
    streaming_recognize_request::StreamingRequest as AsrStreamingRequest,
    tts_server::{Tts, TtsServer},
    AudioConfig, AudioEncoding, NaturalQueryRequest, NaturalQueryResponse, NaturalQueryResult,
    SpeechRecognitionAlternative, SpeechSquadConfig, SpeechSquadInferRequest,
    SpeechSquadInferResponse, StreamingRecognitionResult, StreamingRecognizeRequest,
    StreamingRecognizeResponse, SynthesizeSpeechRequest, SynthesizeSpeechResponse,
};
use speechsquad_proto::EXPECTED_TIMING_LABELS;
use speechsquad_server::{SpeechSquadServiceImpl, SquadResources};

const TRANSCRIPT: &str = "why is the sky blue";

struct MockAsr {
    emit_final: bool,
}

#[tonic::async_trait]
impl Asr for MockAsr {
    type StreamingRecognizeStream = ReceiverStream<Result<StreamingRecognizeResponse, Status>>;

    async fn streaming_recognize(
        &self,
        request: Request<Streaming<StreamingRecognizeRequest>>,
    ) -> Result<Response<Self::StreamingRecognizeStream>, Status> {
        let mut inbound = request.into_inner();
        let emit_final = self.emit_final;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut saw_config = false;
            let mut audio_bytes = 0usize;
            while let Ok(Some(request)) = inbound.message().await {
                match request.streaming_request {
                    Some(AsrStreamingRequest::StreamingConfig(config)) => {
                        assert!(!config.interim_results, "interim results must stay disabled");
                        saw_config = true;
                    }
                    Some(AsrStreamingRequest::AudioContent(content)) => {
                        audio_bytes += content.len();
                    }
                    None => {}
                }
            }
            if saw_config && audio_bytes > 0 && emit_final {
                let response = StreamingRecognizeResponse {
                    results: vec![StreamingRecognitionResult {
                        alternatives: vec![SpeechRecognitionAlternative {
                            transcript: TRANSCRIPT.to_string(),
                            confidence: 0.9,
                        }],
                        is_final: true,
                    }],
                };
                let _ = tx.send(Ok(response)).await;
            }
        });
        let mut response = Response::new(ReceiverStream::new(rx));
        response.metadata_mut().insert(
            "tracing.server_latency.streaming_recognition",
            "40.0".parse().unwrap(),
        );
        Ok(response)
    }
}

#[derive(Clone, Copy)]
enum NlpMode {
    Answer,
    EmptyAnswer,
    NoResults,
}

struct MockNlp {
    mode: NlpMode,
}

#[tonic::async_trait]
impl Nlp for MockNlp {
    async fn natural_query(
        &self,
        request: Request<NaturalQueryRequest>,
    ) -> Result<Response<NaturalQueryResponse>, Status> {
        let query = request.into_inner().query;
        assert!(query.ends_with('?'), "orchestrator appends the question mark");
        let results = match self.mode {
            NlpMode::Answer => vec![NaturalQueryResult {
                answer: "rayleigh scattering".to_string(),
                score: 0.8,
            }],
            NlpMode::EmptyAnswer => vec![NaturalQueryResult {
                answer: String::new(),
                score: 0.5,
            }],
            NlpMode::NoResults => Vec::new(),
        };
        let mut response = Response::new(NaturalQueryResponse { results });
        response.metadata_mut().insert(
            "tracing.server_latency.natural_query",
            "15.0".parse().unwrap(),
        );
        Ok(response)
    }
}

struct MockTts {
    requests: Arc<std::sync::Mutex<Vec<String>>>,
    lead_with_empty: bool,
}

#[tonic::async_trait]
impl Tts for MockTts {
    type SynthesizeOnlineStream =
        Pin<Box<dyn Stream<Item = Result<SynthesizeSpeechResponse, Status>> + Send + 'static>>;

    async fn synthesize_online(
        &self,
        request: Request<SynthesizeSpeechRequest>,
    ) -> Result<Response<Self::SynthesizeOnlineStream>, Status> {
        let request = request.into_inner();
        self.requests.lock().unwrap().push(request.text.clone());
        let lead_with_empty = self.lead_with_empty;
        let stream = async_stream::try_stream! {
            if lead_with_empty {
                yield SynthesizeSpeechResponse { audio: Vec::new() };
            }
            for _ in 0..2 {
                yield SynthesizeSpeechResponse { audio: vec![0u8; 512] };
            }
        };
        let mut response = Response::new(Box::pin(stream) as Self::SynthesizeOnlineStream);
        response.metadata_mut().insert(
            "tracing.server_latency.speech_synthesis",
            "25.0".parse().unwrap(),
        );
        Ok(response)
    }
}

struct Fixture {
    squad_uri: String,
    tts_requests: Arc<std::sync::Mutex<Vec<String>>>,
}

struct FixtureOptions {
    nlp_mode: NlpMode,
    asr_emits_final: bool,
    tts_leads_with_empty: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            nlp_mode: NlpMode::Answer,
            asr_emits_final: true,
            tts_leads_with_empty: false,
        }
    }
}

async fn listen() -> (tokio::net::TcpListener, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    (listener, uri)
}

async fn start_fixture(options: FixtureOptions) -> Fixture {
    let tts_requests = Arc::new(std::sync::Mutex::new(Vec::new()));

    let (asr_listener, asr_uri) = listen().await;
    tokio::spawn(
        Server::builder()
            .add_service(AsrServer::new(MockAsr {
                emit_final: options.asr_emits_final,
            }))
            .serve_with_incoming(TcpListenerStream::new(asr_listener)),
    );

    let (nlp_listener, nlp_uri) = listen().await;
    tokio::spawn(
        Server::builder()
            .add_service(NlpServer::new(MockNlp {
                mode: options.nlp_mode,
            }))
            .serve_with_incoming(TcpListenerStream::new(nlp_listener)),
    );

    let (tts_listener, tts_uri) = listen().await;
    tokio::spawn(
        Server::builder()
            .add_service(TtsServer::new(MockTts {
                requests: Arc::clone(&tts_requests),
                lead_with_empty: options.tts_leads_with_empty,
            }))
            .serve_with_incoming(TcpListenerStream::new(tts_listener)),
    );

    let resources = SquadResources::connect(&asr_uri, &nlp_uri, &tts_uri, 1, String::new())
        .await
        .expect("downstream warm-up");
    let service = SpeechSquadServiceImpl::new(Arc::new(resources), 64);

    let (squad_listener, squad_uri) = listen().await;
    tokio::spawn(
        Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming(TcpListenerStream::new(squad_listener)),
    );

    Fixture {
        squad_uri,
        tts_requests,
    }
}

fn config_request() -> SpeechSquadInferRequest {
    SpeechSquadInferRequest::config(SpeechSquadConfig {
        input_audio_config: Some(AudioConfig {
            encoding: AudioEncoding::LinearPcm as i32,
            sample_rate_hertz: 16000,
            language_code: "en-US".to_string(),
            audio_channel_count: 1,
        }),
        output_audio_config: Some(AudioConfig {
            encoding: AudioEncoding::LinearPcm as i32,
            sample_rate_hertz: 22050,
            language_code: "en-US".to_string(),
            audio_channel_count: 1,
        }),
        squad_context: "the sky is blue because of rayleigh scattering".to_string(),
    })
}

async fn connect(uri: &str) -> SpeechSquadServiceClient<tonic::transport::Channel> {
    let channel = Endpoint::from_shared(format!("http://{uri}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    SpeechSquadServiceClient::new(channel)
}

/// Drive one stream: optionally a config first, then two audio chunks, then
/// half-close; collect every response until the server finishes.
async fn run_question(
    uri: &str,
    config_first: bool,
) -> Result<Vec<SpeechSquadInferResponse>, Status> {
    let mut client = connect(uri).await;
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        if config_first {
            let _ = tx.send(config_request()).await;
        }
        let _ = tx.send(SpeechSquadInferRequest::audio(vec![1u8; 4096])).await;
        let _ = tx.send(SpeechSquadInferRequest::audio(vec![2u8; 4096])).await;
    });
    let response = client.speech_squad_infer(ReceiverStream::new(rx)).await?;
    let mut stream = response.into_inner();
    let mut collected = Vec::new();
    loop {
        match stream.message().await {
            Ok(Some(response)) => collected.push(response),
            Ok(None) => return Ok(collected),
            Err(status) => return Err(status),
        }
    }
}

fn audio_count(responses: &[SpeechSquadInferResponse]) -> usize {
    responses.iter().filter(|r| r.as_audio().is_some()).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_orders_metadata_audio_timings() {
    let fixture = start_fixture(FixtureOptions::default()).await;
    let responses = run_question(&fixture.squad_uri, true).await.unwrap();

    assert!(responses.len() >= 3, "metadata + audio + timings expected");

    let first = responses.first().unwrap().as_metadata().expect("leading metadata");
    assert_eq!(first.squad_question, format!("{TRANSCRIPT}?"));
    assert_eq!(first.squad_answer, "rayleigh scattering");
    assert!(first.component_timing.is_empty());

    let last = responses.last().unwrap().as_metadata().expect("trailing metadata");
    assert!(last.squad_question.is_empty());
    for label in EXPECTED_TIMING_LABELS {
        let ms = last
            .component_timing
            .get(label)
            .unwrap_or_else(|| panic!("missing label {label}"));
        assert!(*ms >= 0.0, "{label} = {ms}");
    }
    assert_eq!(last.component_timing["tracing.server_latency.natural_query"], 15.0);

    // everything between the two metadata responses is audio
    for response in &responses[1..responses.len() - 1] {
        assert!(response.as_audio().is_some());
    }
    assert_eq!(audio_count(&responses), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audio_before_config_cancels_with_invalid_argument() {
    let fixture = start_fixture(FixtureOptions::default()).await;
    let outcome = run_question(&fixture.squad_uri, false).await;
    match outcome {
        Err(status) => assert_eq!(status.code(), tonic::Code::InvalidArgument),
        Ok(responses) => panic!("expected a protocol error, got {} responses", responses.len()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_config_cancels_with_invalid_argument() {
    let fixture = start_fixture(FixtureOptions::default()).await;
    let mut client = connect(&fixture.squad_uri).await;
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let _ = tx.send(config_request()).await;
        let _ = tx.send(SpeechSquadInferRequest::audio(vec![1u8; 1024])).await;
        let _ = tx.send(config_request()).await;
    });
    let mut stream = client
        .speech_squad_infer(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();
    let mut audio_frames = 0;
    let status = loop {
        match stream.message().await {
            Ok(Some(response)) => {
                if response.as_audio().is_some() {
                    audio_frames += 1;
                }
            }
            Ok(None) => panic!("stream must not complete cleanly"),
            Err(status) => break status,
        }
    };
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(audio_frames, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_answer_synthesizes_no_answer_text() {
    let fixture = start_fixture(FixtureOptions {
        nlp_mode: NlpMode::EmptyAnswer,
        ..FixtureOptions::default()
    })
    .await;
    let responses = run_question(&fixture.squad_uri, true).await.unwrap();

    let first = responses.first().unwrap().as_metadata().unwrap();
    assert_eq!(first.squad_answer, "");
    assert!(audio_count(&responses) > 0, "audio for the fallback text expected");

    let last = responses.last().unwrap().as_metadata().unwrap();
    for label in EXPECTED_TIMING_LABELS {
        assert!(last.component_timing.contains_key(label), "missing {label}");
    }
    assert_eq!(
        fixture.tts_requests.lock().unwrap().as_slice(),
        ["No answer"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nlp_without_results_cancels_stream() {
    let fixture = start_fixture(FixtureOptions {
        nlp_mode: NlpMode::NoResults,
        ..FixtureOptions::default()
    })
    .await;
    let outcome = run_question(&fixture.squad_uri, true).await;
    match outcome {
        Err(status) => assert_eq!(status.code(), tonic::Code::Internal),
        Ok(_) => panic!("expected cancellation"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn asr_without_final_result_cancels_stream() {
    let fixture = start_fixture(FixtureOptions {
        asr_emits_final: false,
        ..FixtureOptions::default()
    })
    .await;
    let outcome = run_question(&fixture.squad_uri, true).await;
    match outcome {
        Err(status) => assert_eq!(status.code(), tonic::Code::Internal),
        Ok(_) => panic!("expected cancellation"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_byte_tts_frames_are_skipped_not_fatal() {
    let fixture = start_fixture(FixtureOptions {
        tts_leads_with_empty: true,
        ..FixtureOptions::default()
    })
    .await;
    let responses = run_question(&fixture.squad_uri, true).await.unwrap();
    // the empty frame is dropped, the real frames still flow
    assert_eq!(audio_count(&responses), 2);
    assert!(responses.last().unwrap().as_metadata().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_streams_each_get_one_leading_and_one_trailing_metadata() {
    let fixture = start_fixture(FixtureOptions::default()).await;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let uri = fixture.squad_uri.clone();
        handles.push(tokio::spawn(async move { run_question(&uri, true).await }));
    }
    for handle in handles {
        let responses = handle.await.unwrap().unwrap();
        let metadata: Vec<_> = responses
            .iter()
            .filter_map(|r| r.as_metadata())
            .collect();
        assert_eq!(metadata.len(), 2);
        assert!(!metadata[0].squad_question.is_empty());
        assert!(!metadata[1].component_timing.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_mid_upload_leaves_server_healthy() {
    let fixture = start_fixture(FixtureOptions::default()).await;

    // open a stream, upload a little, then walk away
    {
        let mut client = connect(&fixture.squad_uri).await;
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.send(config_request()).await;
        let _ = tx.send(SpeechSquadInferRequest::audio(vec![1u8; 2048])).await;
        let response = client.speech_squad_infer(ReceiverStream::new(rx)).await.unwrap();
        drop(response);
        drop(tx);
    }

    // the next stream on the same server still completes end to end
    let responses = run_question(&fixture.squad_uri, true).await.unwrap();
    assert_eq!(audio_count(&responses), 2);
}

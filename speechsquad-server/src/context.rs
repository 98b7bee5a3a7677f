//! Per-stream orchestration.
//!
//! One context drives one inbound question stream against the three
//! downstream services in strict phases: upload audio to recognition while
//! draining its results, then one natural-query round trip, then forward
//! the synthesis stream back upstream. All callbacks for a context run on
//! its single task, so ordering within a stream needs no locking. The final
//! timing response is only emitted after every downstream leg has fully
//! drained, which is what keeps upstream completion from racing in-flight
//! downstream events.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tonic::{Status, Streaming};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use speechsquad_proto::pb::speech_squad_infer_request::StreamingRequest;
use speechsquad_proto::pb::{
    AudioConfig, AudioEncoding, NaturalQueryRequest, RecognitionConfig, SpeechSquadInferRequest,
    SpeechSquadInferResponse, SpeechSquadResponseMeta, StreamingRecognitionConfig,
    StreamingRecognizeResponse, SynthesizeSpeechRequest,
};
use speechsquad_proto::{
    ASR_LATENCY_LABEL, NLP_LATENCY_LABEL, TTS_LATENCY_LABEL, TTS_SAMPLE_RATE_HZ,
};

use crate::clients::{self, AsrStream, TtsStream};
use crate::resources::SquadResources;
use crate::timing::{span_ms, TimingLedger};

/// Synthesis voice requested from the TTS service.
const TTS_VOICE_NAME: &str = "ljspeech";

/// Text synthesized when the query produced no answer span.
const NO_ANSWER_TEXT: &str = "No answer";

type ResponseSender = mpsc::Sender<Result<SpeechSquadInferResponse, Status>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Uninitialized,
    Initialized,
    ReceivingAudio,
    AudioUploadComplete,
}

/// Classification of an inbound stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inbound {
    Config,
    Audio,
    HalfClose,
}

/// What the orchestrator does with an inbound event in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    StartRecognition,
    ForwardAudio,
    CloseRecognition,
    Reject(&'static str),
}

/// Protocol transition table. The first message must be a configuration;
/// afterwards only audio is legal until the client half-closes.
pub(crate) fn advance(state: State, inbound: Inbound) -> (State, Action) {
    match (state, inbound) {
        (State::Uninitialized, _) => (state, Action::Reject("stream is not initialized")),
        (State::Initialized, Inbound::Config) => {
            (State::ReceivingAudio, Action::StartRecognition)
        }
        (State::ReceivingAudio, Inbound::Audio) => (State::ReceivingAudio, Action::ForwardAudio),
        (State::ReceivingAudio, Inbound::HalfClose) => {
            (State::AudioUploadComplete, Action::CloseRecognition)
        }
        (_, Inbound::Config) => (state, Action::Reject("configuration message already received")),
        (_, Inbound::Audio) => {
            (state, Action::Reject("audio received before a configuration message"))
        }
        (_, Inbound::HalfClose) => {
            (state, Action::Reject("upload closed before a configuration message"))
        }
    }
}

/// Recognition config derived from the inbound audio config. Interim
/// results stay disabled; only the top alternative is requested.
pub(crate) fn recognition_config(input: &AudioConfig, model: &str) -> StreamingRecognitionConfig {
    StreamingRecognitionConfig {
        config: Some(RecognitionConfig {
            encoding: input.encoding,
            sample_rate_hertz: input.sample_rate_hertz,
            language_code: input.language_code.clone(),
            max_alternatives: 1,
            audio_channel_count: input.audio_channel_count,
            enable_word_time_offsets: false,
            enable_automatic_punctuation: false,
            enable_separate_recognition_per_channel: false,
            model: model.to_string(),
        }),
        interim_results: false,
    }
}

pub(crate) struct StreamContext {
    handle: String,
    state: State,
    squad_context: String,
    tts_config: AudioConfig,
    question: Option<String>,
    answer: String,
    ledger: TimingLedger,
    first_tts_response: bool,
    debug_tts: bool,

    asr_writes_done: Option<Instant>,
    asr_on_complete: Option<Instant>,
    nlp_start: Option<Instant>,
    nlp_finish: Option<Instant>,
    tts_start: Option<Instant>,
    tts_first_packet: Option<Instant>,
}

impl StreamContext {
    fn new() -> Self {
        Self {
            handle: Uuid::new_v4().to_string()[..8].to_string(),
            state: State::Uninitialized,
            squad_context: String::new(),
            tts_config: AudioConfig::default(),
            question: None,
            answer: String::new(),
            ledger: TimingLedger::new(),
            first_tts_response: true,
            debug_tts: false,
            asr_writes_done: None,
            asr_on_complete: None,
            nlp_start: None,
            nlp_finish: None,
            tts_start: None,
            tts_first_packet: None,
        }
    }

    fn apply(&mut self, inbound: Inbound) -> Action {
        let (next, action) = advance(self.state, inbound);
        if next != self.state {
            debug!("stream {}: state {:?} -> {:?}", self.handle, self.state, next);
            self.state = next;
        }
        action
    }

    async fn send(&self, out: &ResponseSender, response: SpeechSquadInferResponse) -> Result<(), Status> {
        out.send(Ok(response))
            .await
            .map_err(|_| Status::cancelled("client disconnected"))
    }

    fn downstream_error(&self, leg: &str, status: Status) -> Status {
        error!(
            "stream {}: {leg} error detected - cancelling squad stream: {}",
            self.handle,
            status.message()
        );
        Status::new(status.code(), format!("{leg}: {}", status.message()))
    }

    async fn drive(
        &mut self,
        resources: &SquadResources,
        mut inbound: Streaming<SpeechSquadInferRequest>,
        out: &ResponseSender,
    ) -> Result<(), Status> {
        debug!("stream {}: state {:?} -> {:?}", self.handle, self.state, State::Initialized);
        self.state = State::Initialized;
        let asr_lease = resources.asr_lease();

        // The first inbound message must carry the configuration.
        let first = match inbound.message().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                let _ = self.apply(Inbound::HalfClose);
                return Err(Status::invalid_argument(
                    "upload closed before a configuration message",
                ));
            }
            Err(status) => return Err(status),
        };
        let config = match first.streaming_request {
            Some(StreamingRequest::SpeechSquadConfig(config)) => {
                match self.apply(Inbound::Config) {
                    Action::StartRecognition => config,
                    Action::Reject(msg) => return Err(Status::invalid_argument(msg)),
                    _ => unreachable!("config transition"),
                }
            }
            Some(StreamingRequest::AudioContent(_)) => {
                if let Action::Reject(msg) = self.apply(Inbound::Audio) {
                    return Err(Status::invalid_argument(msg));
                }
                unreachable!("audio before config is always rejected")
            }
            None => return Err(Status::invalid_argument("empty request message")),
        };

        let input = config
            .input_audio_config
            .ok_or_else(|| Status::invalid_argument("missing input audio config"))?;
        if input.encoding() != AudioEncoding::LinearPcm {
            return Err(Status::unimplemented("only LINEAR_PCM input audio is supported"));
        }
        self.squad_context = config.squad_context;
        self.tts_config = config.output_audio_config.unwrap_or_default();

        debug!(
            "stream {}: initiating recognition; rate={} channels={} language={}",
            self.handle, input.sample_rate_hertz, input.audio_channel_count, input.language_code
        );
        let asr = AsrStream::open(asr_lease, recognition_config(&input, resources.asr_model()))
            .await
            .map_err(|status| self.downstream_error("asr", status))?;
        let AsrStream {
            mut writer,
            mut reader,
        } = asr;

        // Upload audio and drain recognition results concurrently; both
        // sides of the recognition call must finish before moving on.
        let mut upload_done = false;
        let mut recognition_done = false;
        while !upload_done || !recognition_done {
            tokio::select! {
                message = inbound.message(), if !upload_done => match message {
                    Ok(Some(request)) => match request.streaming_request {
                        Some(StreamingRequest::AudioContent(content)) => {
                            if let Action::Reject(msg) = self.apply(Inbound::Audio) {
                                return Err(Status::invalid_argument(msg));
                            }
                            writer
                                .write_audio(content)
                                .await
                                .map_err(|status| self.downstream_error("asr", status))?;
                        }
                        Some(StreamingRequest::SpeechSquadConfig(_)) => {
                            if let Action::Reject(msg) = self.apply(Inbound::Config) {
                                return Err(Status::invalid_argument(msg));
                            }
                        }
                        None => return Err(Status::invalid_argument("empty request message")),
                    },
                    Ok(None) => {
                        if let Action::Reject(msg) = self.apply(Inbound::HalfClose) {
                            return Err(Status::invalid_argument(msg));
                        }
                        self.asr_writes_done = Some(Instant::now());
                        writer.close_writes();
                        upload_done = true;
                    }
                    Err(status) => {
                        debug!("stream {}: inbound stream failed: {}", self.handle, status.message());
                        return Err(status);
                    }
                },
                response = reader.next(), if !recognition_done => match response {
                    Ok(Some(response)) => self.on_asr_response(response),
                    Ok(None) => recognition_done = true,
                    Err(status) => return Err(self.downstream_error("asr", status)),
                },
            }
        }

        self.ledger.absorb(reader.headers());
        if let Ok(Some(trailers)) = reader.trailers().await {
            self.ledger.absorb(&trailers);
        }
        debug!("stream {}: recognition completed", self.handle);

        // Recognition finished OK but never committed a transcript.
        let question = self
            .question
            .clone()
            .ok_or_else(|| Status::internal("asr completed without a final transcript"))?;

        // Natural-query round trip.
        debug!("stream {}: issuing nlp request", self.handle);
        self.nlp_start = Some(Instant::now());
        let outcome = clients::natural_query(
            resources.nlp_lease(),
            NaturalQueryRequest {
                query: question.clone(),
                top_n: 1,
                context: self.squad_context.clone(),
            },
        )
        .await
        .map_err(|status| self.downstream_error("nlp", status))?;
        self.nlp_finish = Some(Instant::now());
        self.ledger.absorb(&outcome.metadata);

        let mut results = outcome.response.results;
        if results.is_empty() {
            return Err(Status::internal("nlp returned no results"));
        }
        let top = results.remove(0);
        let nlp_score = if top.answer.is_empty() { 0.0 } else { top.score };
        self.answer = top.answer;
        info!(
            "stream {}: q: {:?} a: {:?}; score={}",
            self.handle, question, self.answer, nlp_score
        );

        // The single metadata response precedes every audio response.
        self.send(
            out,
            SpeechSquadInferResponse::metadata(SpeechSquadResponseMeta {
                squad_question: question.clone(),
                squad_answer: self.answer.clone(),
                ..Default::default()
            }),
        )
        .await?;

        // Synthesize the answer and forward each frame as it arrives.
        let text = if self.answer.is_empty() {
            NO_ANSWER_TEXT.to_string()
        } else {
            self.answer.clone()
        };
        let request = SynthesizeSpeechRequest {
            text,
            language_code: self.tts_config.language_code.clone(),
            encoding: AudioEncoding::LinearPcm as i32,
            sample_rate_hz: TTS_SAMPLE_RATE_HZ,
            voice_name: TTS_VOICE_NAME.to_string(),
        };
        debug!("stream {}: sending tts request", self.handle);
        self.first_tts_response = true;
        self.tts_start = Some(Instant::now());
        let mut tts = TtsStream::open(resources.tts_lease(), request)
            .await
            .map_err(|status| self.downstream_error("tts", status))?;

        loop {
            match tts.next().await {
                Ok(Some(frame)) => {
                    if self.first_tts_response {
                        debug!("stream {}: relaying first tts response", self.handle);
                        self.tts_first_packet = Some(Instant::now());
                        self.first_tts_response = false;
                    }
                    if frame.audio.is_empty() {
                        warn!("stream {}: received 0 bytes of tts audio", self.handle);
                        self.debug_tts = true;
                        continue;
                    }
                    self.send(out, SpeechSquadInferResponse::audio(frame.audio)).await?;
                }
                Ok(None) => break,
                Err(status) => return Err(self.downstream_error("tts", status)),
            }
        }
        self.ledger.absorb(tts.headers());
        if let Ok(Some(trailers)) = tts.trailers().await {
            self.ledger.absorb(&trailers);
        }
        if self.debug_tts {
            warn!("stream {}: tts stream produced empty frames", self.handle);
        }

        // Measured latencies join the harvested downstream entries.
        self.ledger
            .record(ASR_LATENCY_LABEL, span_ms(self.asr_writes_done, self.asr_on_complete));
        self.ledger
            .record(NLP_LATENCY_LABEL, span_ms(self.nlp_start, self.nlp_finish));
        self.ledger
            .record(TTS_LATENCY_LABEL, span_ms(self.tts_start, self.tts_first_packet));

        // One final metadata response carrying the full timing map, after
        // which the stream half-closes.
        self.send(
            out,
            SpeechSquadInferResponse::metadata(SpeechSquadResponseMeta {
                component_timing: self.ledger.to_component_timing(),
                ..Default::default()
            }),
        )
        .await?;
        Ok(())
    }

    fn on_asr_response(&mut self, response: StreamingRecognizeResponse) {
        let Some(result) = response.results.into_iter().next() else {
            debug!("stream {}: recognition response without results", self.handle);
            return;
        };
        if !result.is_final {
            debug!("stream {}: interim result discarded", self.handle);
            return;
        }
        self.asr_on_complete = Some(Instant::now());
        let Some(top) = result.alternatives.into_iter().next() else {
            error!("stream {}: final result carried no transcript", self.handle);
            return;
        };
        debug!(
            "stream {}: recognition result {:?}; confidence={}",
            self.handle, top.transcript, top.confidence
        );
        self.question = Some(format!("{}?", top.transcript));
    }
}

/// Run one stream to completion, emitting exactly one terminal log line.
/// Errors are forwarded as the stream's terminal status.
pub(crate) async fn run(
    resources: Arc<SquadResources>,
    inbound: Streaming<SpeechSquadInferRequest>,
    out: ResponseSender,
) {
    let mut context = StreamContext::new();
    let handle = context.handle.clone();
    match context.drive(&resources, inbound, &out).await {
        Ok(()) => info!("stream {handle}: completed ok"),
        Err(status) => {
            info!(
                "stream {handle}: terminated with {:?}: {}",
                status.code(),
                status.message()
            );
            let _ = out.send(Err(status)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_must_come_first() {
        let (state, action) = advance(State::Initialized, Inbound::Audio);
        assert_eq!(state, State::Initialized);
        assert!(matches!(action, Action::Reject(_)));

        let (state, action) = advance(State::Initialized, Inbound::Config);
        assert_eq!(state, State::ReceivingAudio);
        assert_eq!(action, Action::StartRecognition);
    }

    #[test]
    fn test_second_config_is_rejected() {
        let (state, action) = advance(State::ReceivingAudio, Inbound::Config);
        assert_eq!(state, State::ReceivingAudio);
        assert!(matches!(action, Action::Reject(_)));
    }

    #[test]
    fn test_audio_flows_until_half_close() {
        let (state, action) = advance(State::ReceivingAudio, Inbound::Audio);
        assert_eq!(state, State::ReceivingAudio);
        assert_eq!(action, Action::ForwardAudio);

        let (state, action) = advance(State::ReceivingAudio, Inbound::HalfClose);
        assert_eq!(state, State::AudioUploadComplete);
        assert_eq!(action, Action::CloseRecognition);
    }

    #[test]
    fn test_nothing_legal_after_upload_completes() {
        for inbound in [Inbound::Config, Inbound::Audio, Inbound::HalfClose] {
            let (state, action) = advance(State::AudioUploadComplete, inbound);
            assert_eq!(state, State::AudioUploadComplete);
            assert!(matches!(action, Action::Reject(_)), "{inbound:?} must be rejected");
        }
    }

    #[test]
    fn test_recognition_config_pins_streaming_options() {
        let input = AudioConfig {
            encoding: AudioEncoding::LinearPcm as i32,
            sample_rate_hertz: 16000,
            language_code: "en-US".into(),
            audio_channel_count: 1,
        };
        let streaming = recognition_config(&input, "quartznet");
        assert!(!streaming.interim_results);
        let config = streaming.config.unwrap();
        assert_eq!(config.max_alternatives, 1);
        assert_eq!(config.sample_rate_hertz, 16000);
        assert_eq!(config.model, "quartznet");
        assert!(!config.enable_automatic_punctuation);
    }
}

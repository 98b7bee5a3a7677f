//! Wire contract for the speech-squad pipeline.
//!
//! The protobuf source of truth lives in `proto/speech_squad.proto`; the
//! tonic/prost output is checked in under `src/gen/` so builds do not need
//! protoc. Regenerate with tonic-build 0.12 when the proto changes.

pub mod pb {
    include!("gen/speechsquad.rs");
}

use pb::speech_squad_infer_request::StreamingRequest;
use pb::speech_squad_infer_response::StreamingResponse;
use pb::{SpeechSquadConfig, SpeechSquadInferRequest, SpeechSquadInferResponse, SpeechSquadResponseMeta};

/// Prefix selecting latency entries from downstream call metadata.
pub const TRACING_PREFIX: &str = "tracing.";

/// Latencies measured by the orchestrator itself.
pub const ASR_LATENCY_LABEL: &str = "tracing.speech_squad.asr_latency";
pub const NLP_LATENCY_LABEL: &str = "tracing.speech_squad.nlp_latency";
pub const TTS_LATENCY_LABEL: &str = "tracing.speech_squad.tts_latency";

/// Timing labels every stream that terminates OK must carry in its final
/// metadata response.
pub const EXPECTED_TIMING_LABELS: [&str; 6] = [
    "tracing.server_latency.natural_query",
    "tracing.server_latency.speech_synthesis",
    "tracing.server_latency.streaming_recognition",
    ASR_LATENCY_LABEL,
    NLP_LATENCY_LABEL,
    TTS_LATENCY_LABEL,
];

/// Sample rate of all synthesized answer audio.
pub const TTS_SAMPLE_RATE_HZ: i32 = 22050;

impl SpeechSquadInferRequest {
    pub fn config(config: SpeechSquadConfig) -> Self {
        Self {
            streaming_request: Some(StreamingRequest::SpeechSquadConfig(config)),
        }
    }

    pub fn audio(content: Vec<u8>) -> Self {
        Self {
            streaming_request: Some(StreamingRequest::AudioContent(content)),
        }
    }
}

impl SpeechSquadInferResponse {
    pub fn metadata(meta: SpeechSquadResponseMeta) -> Self {
        Self {
            streaming_response: Some(StreamingResponse::Metadata(meta)),
        }
    }

    pub fn audio(content: Vec<u8>) -> Self {
        Self {
            streaming_response: Some(StreamingResponse::AudioContent(content)),
        }
    }

    /// The metadata payload, if this is a metadata response.
    pub fn as_metadata(&self) -> Option<&SpeechSquadResponseMeta> {
        match &self.streaming_response {
            Some(StreamingResponse::Metadata(meta)) => Some(meta),
            _ => None,
        }
    }

    /// The audio payload, if this is an audio response.
    pub fn as_audio(&self) -> Option<&[u8]> {
        match &self.streaming_response {
            Some(StreamingResponse::AudioContent(content)) => Some(content.as_slice()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_labels_are_tracing_scoped() {
        assert_eq!(EXPECTED_TIMING_LABELS.len(), 6);
        for label in EXPECTED_TIMING_LABELS {
            assert!(label.starts_with(TRACING_PREFIX), "bad label: {label}");
        }
    }

    #[test]
    fn test_response_accessors() {
        let meta = SpeechSquadResponseMeta {
            squad_question: "why?".into(),
            ..Default::default()
        };
        let response = SpeechSquadInferResponse::metadata(meta);
        assert_eq!(response.as_metadata().unwrap().squad_question, "why?");
        assert!(response.as_audio().is_none());

        let response = SpeechSquadInferResponse::audio(vec![1, 2, 3]);
        assert_eq!(response.as_audio(), Some(&[1u8, 2, 3][..]));
        assert!(response.as_metadata().is_none());
    }
}

//! Typed adapters over the three downstream services.
//!
//! Each adapter owns its channel lease for the lifetime of the call, which
//! is what the pool's P2C pick counts. Cancellation is ownership: dropping
//! an adapter tears the underlying call down.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::Streaming;
use tonic::metadata::MetadataMap;
use tonic::Status;

use speechsquad_proto::pb::asr_client::AsrClient;
use speechsquad_proto::pb::nlp_client::NlpClient;
use speechsquad_proto::pb::streaming_recognize_request::StreamingRequest;
use speechsquad_proto::pb::tts_client::TtsClient;
use speechsquad_proto::pb::{
    NaturalQueryRequest, NaturalQueryResponse, StreamingRecognitionConfig,
    StreamingRecognizeRequest, StreamingRecognizeResponse, SynthesizeSpeechRequest,
    SynthesizeSpeechResponse,
};

use crate::pool::ChannelLease;

/// Bidirectional recognition stream, split so audio uploads and response
/// draining can interleave in one select loop.
pub struct AsrStream {
    pub writer: AsrWriter,
    pub reader: AsrReader,
}

pub struct AsrWriter {
    tx: Option<mpsc::Sender<StreamingRecognizeRequest>>,
}

pub struct AsrReader {
    headers: MetadataMap,
    responses: Streaming<StreamingRecognizeResponse>,
    _lease: ChannelLease,
}

impl AsrStream {
    /// Start the recognition call; the configuration message is the first
    /// write on the wire.
    pub async fn open(
        lease: ChannelLease,
        config: StreamingRecognitionConfig,
    ) -> Result<Self, Status> {
        let (tx, rx) = mpsc::channel(8);
        let initial = StreamingRecognizeRequest {
            streaming_request: Some(StreamingRequest::StreamingConfig(config)),
        };
        tx.send(initial)
            .await
            .map_err(|_| Status::internal("asr request channel closed before start"))?;

        let mut client = AsrClient::new(lease.channel());
        let response = client.streaming_recognize(ReceiverStream::new(rx)).await?;
        let headers = response.metadata().clone();
        Ok(Self {
            writer: AsrWriter { tx: Some(tx) },
            reader: AsrReader {
                headers,
                responses: response.into_inner(),
                _lease: lease,
            },
        })
    }
}

impl AsrWriter {
    pub async fn write_audio(&mut self, content: Vec<u8>) -> Result<(), Status> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Status::internal("asr upload already closed"))?;
        let request = StreamingRecognizeRequest {
            streaming_request: Some(StreamingRequest::AudioContent(content)),
        };
        tx.send(request)
            .await
            .map_err(|_| Status::unavailable("asr stream closed"))
    }

    /// Half-close the upload; recognition finalizes once the service drains
    /// what it has.
    pub fn close_writes(&mut self) {
        self.tx.take();
    }
}

impl AsrReader {
    pub fn headers(&self) -> &MetadataMap {
        &self.headers
    }

    pub async fn next(&mut self) -> Result<Option<StreamingRecognizeResponse>, Status> {
        self.responses.message().await
    }

    pub async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
        self.responses.trailers().await
    }
}

/// Completed unary NLP exchange.
pub struct NlpOutcome {
    pub response: NaturalQueryResponse,
    pub metadata: MetadataMap,
}

/// One natural-query round trip; the lease is held for the duration of the
/// call and released on return.
pub async fn natural_query(
    lease: ChannelLease,
    request: NaturalQueryRequest,
) -> Result<NlpOutcome, Status> {
    let mut client = NlpClient::new(lease.channel());
    let response = client.natural_query(request).await?;
    let metadata = response.metadata().clone();
    Ok(NlpOutcome {
        response: response.into_inner(),
        metadata,
    })
}

/// Server-streaming synthesis call.
pub struct TtsStream {
    headers: MetadataMap,
    responses: Streaming<SynthesizeSpeechResponse>,
    _lease: ChannelLease,
}

impl TtsStream {
    pub async fn open(lease: ChannelLease, request: SynthesizeSpeechRequest) -> Result<Self, Status> {
        let mut client = TtsClient::new(lease.channel());
        let response = client.synthesize_online(request).await?;
        let headers = response.metadata().clone();
        Ok(Self {
            headers,
            responses: response.into_inner(),
            _lease: lease,
        })
    }

    pub fn headers(&self) -> &MetadataMap {
        &self.headers
    }

    pub async fn next(&mut self) -> Result<Option<SynthesizeSpeechResponse>, Status> {
        self.responses.message().await
    }

    pub async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
        self.responses.trailers().await
    }
}

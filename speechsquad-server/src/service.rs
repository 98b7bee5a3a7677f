//! gRPC front service.
//!
//! Every accepted stream takes a context permit and runs its orchestration
//! on its own task; the permit count (worker threads x contexts per thread)
//! is what back-pressures new streams when the server is saturated.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use speechsquad_proto::pb::speech_squad_service_server::{
    SpeechSquadService, SpeechSquadServiceServer,
};
use speechsquad_proto::pb::{SpeechSquadInferRequest, SpeechSquadInferResponse};

use crate::context;
use crate::resources::SquadResources;

/// Responses are forwarded as they are produced; the buffer only smooths
/// bursts from the synthesis stream.
const RESPONSE_BUFFER: usize = 32;

pub struct SpeechSquadServiceImpl {
    resources: Arc<SquadResources>,
    contexts: Arc<Semaphore>,
}

impl SpeechSquadServiceImpl {
    pub fn new(resources: Arc<SquadResources>, max_contexts: usize) -> Self {
        Self {
            resources,
            contexts: Arc::new(Semaphore::new(max_contexts)),
        }
    }

    /// Create the gRPC server for this service
    pub fn into_server(self) -> SpeechSquadServiceServer<Self> {
        SpeechSquadServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl SpeechSquadService for SpeechSquadServiceImpl {
    type SpeechSquadInferStream = ReceiverStream<Result<SpeechSquadInferResponse, Status>>;

    async fn speech_squad_infer(
        &self,
        request: Request<Streaming<SpeechSquadInferRequest>>,
    ) -> Result<Response<Self::SpeechSquadInferStream>, Status> {
        let permit = self
            .contexts
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Status::unavailable("server is shutting down"))?;

        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let resources = Arc::clone(&self.resources);
        tokio::spawn(async move {
            let _permit = permit;
            context::run(resources, inbound, tx).await;
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

//! Speech-squad server binary.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use speechsquad_server::{SpeechSquadServiceImpl, SquadResources};

#[derive(Parser, Debug)]
#[command(name = "speech-squad-server", about = "Voice question answering orchestrator")]
struct Args {
    /// Address to serve the speech-squad service on
    #[arg(long = "uri", default_value = "0.0.0.0:1337")]
    uri: String,

    /// URL of the streaming recognition endpoint
    #[arg(long = "asr_service_url", default_value = "127.0.0.1:50052")]
    asr_service_url: String,

    /// URL of the natural query endpoint
    #[arg(long = "nlp_service_url", default_value = "127.0.0.1:50053")]
    nlp_service_url: String,

    /// URL of the speech synthesis endpoint
    #[arg(long = "tts_service_url", default_value = "127.0.0.1:50054")]
    tts_service_url: String,

    /// Number of runtime worker threads
    #[arg(long = "threads", default_value_t = 10)]
    threads: usize,

    /// Maximum number of concurrent stream contexts per worker thread
    #[arg(long = "contexts_per_thread", default_value_t = 100)]
    contexts_per_thread: usize,

    /// Number of persistent channels per downstream service
    #[arg(long = "channels", default_value_t = 50)]
    channels: usize,

    /// Recognition model name passed through to the ASR service
    #[arg(long = "asr_model", default_value = "")]
    asr_model: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.threads.max(1))
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(serve(args))
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let resources = SquadResources::connect(
        &args.asr_service_url,
        &args.nlp_service_url,
        &args.tts_service_url,
        args.channels,
        args.asr_model.clone(),
    )
    .await
    .context("downstream warm-up failed")?;

    let max_contexts = args.threads.max(1) * args.contexts_per_thread.max(1);
    let service = SpeechSquadServiceImpl::new(Arc::new(resources), max_contexts);

    let addr = args.uri.parse().context("invalid --uri")?;
    info!("speech-squad service listening on {addr}");
    Server::builder()
        .add_service(service.into_server())
        .serve(addr)
        .await
        .context("server terminated")?;
    Ok(())
}

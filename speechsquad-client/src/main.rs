//! Speech-squad load-generator binary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use speechsquad_client::channels::ChannelSet;
use speechsquad_client::coordinator::{self, Collective, SingleProcess};
use speechsquad_client::dataset::{self, SquadEvalDataset};
use speechsquad_client::error::ClientError;
use speechsquad_client::output::{self, OutputSinks};
use speechsquad_client::scheduler::{self, LoadConfig};
use speechsquad_client::task::TaskSettings;
use speechsquad_client::{audio, stats};

#[derive(Parser, Debug)]
#[command(name = "speech-squad-client", about = "Paced load generator for speech-squad")]
struct Args {
    /// Json file with the location of the audio file for each question
    #[arg(long = "squad_questions_json", default_value = "questions.json")]
    squad_questions_json: String,

    /// Json file with the squad dataset
    #[arg(long = "squad_dataset_json", default_value = "dev-v2.0.json")]
    squad_dataset_json: String,

    /// URI of the speech-squad server
    #[arg(long = "speech_squad_uri", default_value = "localhost:50051")]
    speech_squad_uri: String,

    /// Number of times to loop over the audio files
    #[arg(long = "num_iterations", default_value_t = 1)]
    num_iterations: usize,

    /// Number of grpc channels to create (-1 derives it from the request count)
    #[arg(long = "channel_num", default_value_t = -1)]
    channel_num: i64,

    /// Minimum offset in microseconds between successive stream launches
    /// (-1 spreads the streams uniformly across one chunk period)
    #[arg(long = "offset_duration", default_value_t = -1)]
    offset_duration: i64,

    /// Occupy a slot until the stream fully completes rather than until the
    /// upload finishes
    #[arg(long = "true_concurrency", default_value_t = true, action = clap::ArgAction::Set)]
    true_concurrency: bool,

    /// Number of parallel requests to keep in flight
    #[arg(long = "num_parallel_requests", default_value_t = 1)]
    num_parallel_requests: usize,

    /// Chunk duration in milliseconds
    #[arg(long = "chunk_duration_ms", default_value_t = 800)]
    chunk_duration_ms: u32,

    /// Streaming I/O worker threads (0 uses the hardware concurrency)
    #[arg(long = "executor_count", default_value_t = 0)]
    executor_count: usize,

    /// Write the recognized questions, answers and synthesized audio
    #[arg(long = "print_results", default_value_t = true, action = clap::ArgAction::Set)]
    print_results: bool,

    /// Folder for the returned audio data and the result json files
    #[arg(long = "output_root_folder", default_value = "./final_results")]
    output_root_folder: String,

    /// Questions filename within --output_root_folder
    #[arg(long = "question_output_filename", default_value = "squad_question.json")]
    question_output_filename: String,

    /// Answers filename within --output_root_folder
    #[arg(long = "answer_output_filename", default_value = "squad_answers.json")]
    answer_output_filename: String,

    /// Synthesized-audio record filename within --output_root_folder
    #[arg(long = "output_wave_filename", default_value = "squad_output_wave.json")]
    output_wave_filename: String,

    /// Rank of this process within the peer group
    #[arg(long = "proc_index", default_value_t = 0)]
    proc_index: usize,

    /// Number of cooperating peer processes
    #[arg(long = "proc_count", default_value_t = 1)]
    proc_count: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let code = {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if args.executor_count > 0 {
            builder.worker_threads(args.executor_count);
        }
        match builder.enable_all().build() {
            Ok(runtime) => runtime.block_on(execute(args)),
            Err(e) => {
                eprintln!("failed to build runtime: {e}");
                1
            }
        }
    };
    process::exit(code);
}

async fn execute(args: Args) -> i32 {
    match run_client(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

async fn run_client(args: Args) -> Result<i32, ClientError> {
    // The inter-process transport is wired in by the launcher; standalone
    // runs reduce over a single peer.
    let collective = SingleProcess;

    let proc_count = args.proc_count.max(1);
    if proc_count > args.num_parallel_requests {
        return Err(ClientError::InvalidArg(
            "--num_parallel_requests can not be less than the number of peer processes".to_string(),
        ));
    }
    if args.proc_index >= proc_count {
        return Err(ClientError::InvalidArg(
            "--proc_index must be smaller than --proc_count".to_string(),
        ));
    }
    let num_parallel = coordinator::split_parallel_requests(
        args.num_parallel_requests,
        args.proc_index,
        proc_count,
    );

    let sinks = if args.print_results {
        let root = PathBuf::from(&args.output_root_folder);
        let out_root = if proc_count > 1 {
            output::create_output_directory(&root, true)?;
            root.join(format!("proc{}", args.proc_index))
        } else {
            root
        };
        collective.barrier();
        output::create_output_directory(&out_root, false)?;
        Some(Arc::new(OutputSinks::create(
            &out_root,
            &args.question_output_filename,
            &args.answer_output_filename,
            &args.output_wave_filename,
        )?))
    } else {
        None
    };

    let channel_count = if args.channel_num < 0 {
        num_parallel / 100 + 1
    } else {
        (args.channel_num as usize).max(1)
    };
    let channels = Arc::new(ChannelSet::connect(&args.speech_squad_uri, channel_count).await?);
    info!("opened {} channels to {}", channels.len(), args.speech_squad_uri);

    let dataset = Arc::new(SquadEvalDataset::load_from_json(&args.squad_dataset_json)?);
    info!("loaded {} squad questions", dataset.len());

    collective.barrier();
    if args.proc_index == 0 {
        println!("Loading eval dataset...");
    }
    let entries = dataset::load_question_manifest(&args.squad_questions_json)?;
    let clips = audio::load_clips(&entries, args.proc_index, proc_count)?;
    if clips.is_empty() {
        return Err(ClientError::NotFound(format!(
            "no audio clips assigned to process {}; provide a minimum of {proc_count} questions",
            args.proc_index
        )));
    }
    println!(
        "Done loading {} files for process {}",
        clips.len(),
        args.proc_index
    );

    let iterations = args.num_iterations.max(1);
    let mut all_clips = Vec::with_capacity(clips.len() * iterations);
    for clip in &clips {
        for _ in 0..iterations {
            all_clips.push(Arc::clone(clip));
        }
    }

    let offset_duration_us = if args.offset_duration < 0 {
        u64::from(args.chunk_duration_ms) * 1000 / num_parallel.max(1) as u64
    } else {
        args.offset_duration as u64
    };
    let config = LoadConfig {
        num_parallel_requests: num_parallel,
        offset_duration_us,
        true_concurrency: args.true_concurrency,
        proc_index: args.proc_index,
        task_settings: TaskSettings {
            language_code: "en-US".to_string(),
            chunk_duration_ms: args.chunk_duration_ms,
            print_results: args.print_results,
        },
    };

    collective.barrier();
    if args.proc_index == 0 {
        println!("Generating load...");
    }
    collective.barrier();
    let start_time = Instant::now();
    let stats = match scheduler::run_load(all_clips, channels, dataset, sinks.clone(), config).await
    {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Failed to generate specified load. Error details: {e}");
            return Ok(-1);
        }
    };
    collective.barrier();
    let wall_ms = start_time.elapsed().as_secs_f64() * 1000.0;

    if args.proc_index == 0 {
        println!();
        println!("Done with measurements");
        println!("Generating Statistics Report...");
    }
    if let Some(sinks) = &sinks {
        sinks.finish()?;
    }

    println!("\t\t================ Process {} ================", args.proc_index);
    let averages = stats::print_process_stats(&stats);

    let total_audio = collective.sum_f64(stats.total_audio_secs);
    let failed = collective.sum_u64(stats.failed_tasks);
    let mut summed_averages = HashMap::new();
    for (label, avg) in &averages {
        summed_averages.insert(label.clone(), collective.sum_f64(*avg));
    }
    let success_procs = collective.sum_u64(u64::from(averages.contains_key("Client Latency")));

    collective.barrier();
    if args.proc_index == 0 {
        stats::print_final_report(wall_ms, total_audio, failed, &summed_averages, success_procs);
    }
    Ok(0)
}

// src/main.rs
//
// =============================================================================
// TRANSCODE CLUSTER: COMMANDER & ENTRY POINT
// =============================================================================
//
// The wiring center of the binary. Two long-lived process roles
// (`coordinator`, `worker`) plus a handful of direct-library admin verbs.
// The CLI surface itself is an excluded concern (spec.md §1) — this exists
// only so the crate is runnable end to end, in the teacher's
// `Parser`/`Subcommand` style (src/main.rs).
//
// Key behaviors kept from the teacher:
// - Graceful shutdown via `Arc<AtomicBool>` flipped on Ctrl-C.
// - A single `run_node_service`-style entry each role funnels through.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use transcode_cluster::{
    ClusterTransport, CoordinatorConfig, Coordinator, Engine, JobSpec, LocalTransport, Priority,
    QueueClass, Store, WorkerConfig, WorkerHarness,
};

#[derive(Parser)]
#[command(name = "transcode-cluster", about = "Distributed transcoding cluster orchestration kernel")]
struct Cli {
    /// Path to the SQLite store.
    #[arg(long, global = true, default_value = "transcode-cluster.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the three coordinator maintenance loops against the store.
    Coordinator,
    /// Run the worker execution harness, registering against the store in-process.
    Worker {
        /// Defaults to the machine's hostname when omitted.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "127.0.0.1:0")]
        address: String,
        #[arg(long, default_value = "./work")]
        work_dir: PathBuf,
    },
    /// Submit a job.
    Submit {
        scenario: String,
        #[arg(long, value_enum, default_value = "auto")]
        engine: EngineArg,
        #[arg(long, value_enum, default_value = "default")]
        queue: QueueArg,
        #[arg(long, value_enum, default_value = "medium")]
        priority: PriorityArg,
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        output: Option<String>,
    },
    /// Fetch one job by sequence number.
    Get { sequence_number: i64 },
    /// List jobs (summary view).
    List,
    /// Cancel a job by sequence number.
    Cancel { sequence_number: i64 },
}

#[derive(Clone, clap::ValueEnum)]
enum EngineArg {
    Auto,
    Ffmpeg,
    Gstreamer,
}

#[derive(Clone, clap::ValueEnum)]
enum QueueArg {
    Live,
    Default,
    Batch,
}

#[derive(Clone, clap::ValueEnum)]
enum PriorityArg {
    High,
    Medium,
    Low,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let store = Arc::new(Store::open(&cli.db).context("opening store")?);

    match cli.command {
        Commands::Coordinator => run_coordinator(store).await,
        Commands::Worker { name, address, work_dir } => {
            run_worker(store, name, address, work_dir).await
        }
        Commands::Submit {
            scenario,
            engine,
            queue,
            priority,
            input,
            output,
        } => {
            let transport = LocalTransport::new(store);
            let mut parameters = std::collections::HashMap::new();
            if let Some(i) = input {
                parameters.insert("input".to_string(), serde_json::json!(i));
            }
            if let Some(o) = output {
                parameters.insert("output".to_string(), serde_json::json!(o));
            }
            let spec = JobSpec {
                scenario,
                engine: match engine {
                    EngineArg::Auto => Engine::Auto,
                    EngineArg::Ffmpeg => Engine::Ffmpeg,
                    EngineArg::Gstreamer => Engine::Gstreamer,
                },
                queue: match queue {
                    QueueArg::Live => QueueClass::Live,
                    QueueArg::Default => QueueClass::Default,
                    QueueArg::Batch => QueueClass::Batch,
                },
                priority: match priority {
                    PriorityArg::High => Priority::High,
                    PriorityArg::Medium => Priority::Medium,
                    PriorityArg::Low => Priority::Low,
                },
                confidence_hint: None,
                parameters,
                max_retries: 3,
            };
            let job = transport.submit_job(spec).await?;
            println!("submitted job {} (seq {})", job.id, job.sequence_number);
            Ok(())
        }
        Commands::Get { sequence_number } => {
            let job = store.get_job_by_seq(sequence_number)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Commands::List => {
            for summary in store.list_jobs_summary()? {
                let queue_name = match summary.queue {
                    QueueClass::Live => "live",
                    QueueClass::Default => "default",
                    QueueClass::Batch => "batch",
                };
                let priority_name = match summary.priority {
                    Priority::High => "high",
                    Priority::Medium => "medium",
                    Priority::Low => "low",
                };
                println!(
                    "#{:<6} {:<10} {:<8} {:<7} {:>3}%",
                    summary.sequence_number,
                    summary.status.as_db_str(),
                    queue_name,
                    priority_name,
                    summary.progress_pct
                );
            }
            Ok(())
        }
        Commands::Cancel { sequence_number } => {
            let job = store.get_job_by_seq(sequence_number)?;
            let transport = LocalTransport::new(store);
            transport.cancel_job(job.id).await?;
            println!("canceled job #{sequence_number}");
            Ok(())
        }
    }
}

async fn run_coordinator(store: Arc<Store>) -> Result<()> {
    let config = CoordinatorConfig::from_env();
    let coordinator = Coordinator::new(store, config);
    let shutdown = Arc::new(AtomicBool::new(false));

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received, stopping coordinator loops");
        shutdown_signal.store(true, Ordering::Relaxed);
    });

    coordinator.run(shutdown).await;
    Ok(())
}

async fn run_worker(
    store: Arc<Store>,
    name: Option<String>,
    address: String,
    work_dir: PathBuf,
) -> Result<()> {
    std::fs::create_dir_all(&work_dir).context("creating worker work directory")?;
    let config = WorkerConfig::from_env();
    let transport: Arc<dyn ClusterTransport> = Arc::new(LocalTransport::new(store));
    let harness = WorkerHarness::new(transport, config, work_dir);
    let name = name.unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "local-worker".to_string())
    });
    harness.boot(name, address).await?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received, stopping worker");
        shutdown_signal.store(true, Ordering::Relaxed);
    });

    harness.run(shutdown).await;
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use schoolsheet::export::{export_job, MarkdownRenderer};
use schoolsheet::inference::llama::{LlamaRuntime, LlamaRuntimeConfig};
use schoolsheet::inference::{EngineManager, LifecycleStatus};
use schoolsheet::queue::GenerationQueue;
use schoolsheet::storage::model_cache::ModelCacheStore;
use schoolsheet::storage::queue_store::QueueStore;
use schoolsheet::storage::results::ResultStore;
use schoolsheet::storage::settings::{load_settings, AtelierSettings};
use schoolsheet::storage::{get_data_dir, FileStore, KeyValueStore};
use schoolsheet::system::capability::AccelerationProbe;
use schoolsheet::types::catalog::{Grade, StaticCatalog};
use schoolsheet::types::model::model_catalog;

/// Schoolsheet - worksheets from a model running on this machine
#[derive(Parser)]
#[command(name = "schoolsheet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Catalog JSON file (default: <data dir>/catalog.json)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a worksheet for a catalog topic
    Enqueue {
        /// Subject id
        subject: String,

        /// Topic id
        topic: String,

        /// Grade 1-4 (default: the topic's first grade)
        #[arg(long)]
        grade: Option<u8>,

        /// Model to use for this worksheet
        #[arg(long, short)]
        model: Option<String>,

        /// Concrete task instead of the topic's sample prompts
        #[arg(long, short)]
        prompt: Option<String>,
    },

    /// Generate every pending worksheet
    Run,

    /// Show the queue
    List,

    /// Show archived worksheets
    Results {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Cancel a pending job
    Cancel { id: Uuid },

    /// Delete a finished job and its archived worksheet
    Delete { id: Uuid },

    /// Write a finished worksheet as markdown
    Export {
        id: Uuid,

        /// Output directory
        #[arg(long, short, default_value = ".")]
        out: PathBuf,
    },

    /// List known models
    Models,
}

struct App {
    settings: AtelierSettings,
    catalog: Arc<StaticCatalog>,
    queue: Arc<GenerationQueue>,
}

impl App {
    fn open(catalog_path: Option<PathBuf>) -> Result<Self> {
        let settings = load_settings();
        let catalog_path = match catalog_path {
            Some(path) => path,
            None => get_data_dir()?.join("catalog.json"),
        };
        let catalog = if catalog_path.exists() {
            StaticCatalog::load(&catalog_path)
                .with_context(|| format!("Failed to read catalog {:?}", catalog_path))?
        } else {
            tracing::warn!("No catalog at {:?}", catalog_path);
            StaticCatalog::default()
        };
        let catalog = Arc::new(catalog);

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open_default()?);
        let runtime = LlamaRuntime::new(LlamaRuntimeConfig::from(&settings));
        let engine = EngineManager::new(
            Arc::new(runtime),
            settings.engine_config(),
            ModelCacheStore::new(store.clone(), settings.default_model_id.clone()),
        );
        let queue = GenerationQueue::new(
            engine,
            catalog.clone(),
            QueueStore::new(store.clone()),
            ResultStore::with_limit(store, settings.result_history_limit),
        );

        Ok(Self {
            settings,
            catalog,
            queue,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    schoolsheet::init_tracing();

    let cli = Cli::parse();
    let app = App::open(cli.catalog)?;

    match cli.command {
        Commands::Enqueue {
            subject,
            topic,
            grade,
            model,
            prompt,
        } => {
            let topic = app
                .catalog
                .topic(&subject, &topic)
                .cloned()
                .ok_or_else(|| anyhow!("Unknown topic {}/{}", subject, topic))?;
            let grade = match grade {
                Some(n) => Some(Grade::from_number(n).ok_or_else(|| anyhow!("Grade must be 1-4"))?),
                None => None,
            };
            let grade = topic.grade_for(grade);
            let id = app.queue.enqueue(topic, grade, subject, model, prompt);
            println!("{}", id);
        }
        Commands::Run => run(&app).await?,
        Commands::List => {
            for job in app.queue.jobs() {
                println!(
                    "{}  {:<9}  Klasse {}  {}  {}",
                    job.id,
                    format!("{:?}", job.status).to_lowercase(),
                    job.grade,
                    job.topic.label,
                    job.model_id.as_deref().unwrap_or("-")
                );
                if let Some(error) = &job.error {
                    println!("    {}", error);
                }
            }
            let summary = app.queue.summary();
            println!("{} active, {} completed", summary.active, summary.completed);
        }
        Commands::Results { limit } => {
            for result in app.queue.results().list_recent(limit) {
                println!(
                    "{}  {}  Klasse {}  {}  {}",
                    result.id,
                    result.created_at.format("%Y-%m-%d %H:%M"),
                    result.grade,
                    result.topic.label,
                    result.model_id
                );
            }
        }
        Commands::Cancel { id } => {
            app.queue.cancel(id).await?;
            println!("Cancelled {}", id);
        }
        Commands::Delete { id } => {
            app.queue.delete(id)?;
            println!("Deleted {}", id);
        }
        Commands::Export { id, out } => {
            let job = app
                .queue
                .get(id)
                .ok_or_else(|| anyhow!("Job not found: {}", id))?;
            let document = export_job(&job, &MarkdownRenderer)?;
            let path = document.write_to(&out)?;
            println!("{}", path.display());
        }
        Commands::Models => {
            let cached = app.queue.engine().cached_models();
            for model in model_catalog() {
                let marker = if cached.contains(model.id) { "*" } else { " " };
                println!(
                    "{} {:<32} {:<24} {}",
                    marker, model.id, model.label, model.download_size_label
                );
            }
        }
    }

    Ok(())
}

/// Drain the queue, reporting engine progress on stderr
async fn run(app: &App) -> Result<()> {
    let engine = app.queue.engine().clone();
    let report = engine.detect_capability(&AccelerationProbe::new(app.settings.allow_cpu_inference));
    if !report.supported {
        bail!(report.reason.unwrap_or_else(|| "Hardware not supported".to_string()));
    }

    let mut snapshots = engine.subscribe();
    let progress = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if let Some(p) = snapshot.progress {
                eprintln!("[{:>3.0}%] {}", p.fraction_complete * 100.0, p.message);
            }
            if snapshot.status == LifecycleStatus::Error {
                if let Some(error) = snapshot.error {
                    eprintln!("Engine error: {}", error);
                }
            }
        }
    });

    let processed = app.queue.drain().await;
    progress.abort();

    for job in processed.into_iter().filter_map(|id| app.queue.get(id)) {
        match &job.error {
            Some(error) => println!("{}  error: {}", job.id, error),
            None => println!("{}  {:?}", job.id, job.status),
        }
    }
    Ok(())
}

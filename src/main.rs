//! # LetsLearn CLI (`letslearn`)
//!
//! Local study assistant: turn documents into searchable knowledge, then ask
//! questions and generate notes, flashcards and quizzes from it.
//!
//! ## Usage
//!
//! ```bash
//! letslearn --config ./config/letslearn.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `letslearn init` | Create the data folder and the projects store |
//! | `letslearn project create <name>` | Create a project |
//! | `letslearn project add <project> <file>` | Register and embed a document |
//! | `letslearn project load <project>` | Embed every document of a project |
//! | `letslearn project list` | List projects |
//! | `letslearn ask <project> "<question>"` | Answer from the project's documents |
//! | `letslearn explain --text "<passage>" "<question>"` | Explain a highlighted passage |
//! | `letslearn topics <project>` | Key topics (cached) |
//! | `letslearn summary <project>` | Summary of all material (cached) |
//! | `letslearn notes <project> <topic>` | Study notes for a topic (cached) |
//! | `letslearn flashcards <project>` | Flashcards (cached per topic) |
//! | `letslearn quiz <project>` | Multiple-choice quiz from the topic's pool |
//! | `letslearn submit <project> <result.json>` | Record a quiz result |
//! | `letslearn mastery <project>` | Per-topic mastery |
//! | `letslearn images <project>` | Saved images |
//! | `letslearn cache <project>` | Which cache keys are filled |
//! | `letslearn serve` | Start the HTTP API |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use letslearn::config;
use letslearn::generation::TextStream;
use letslearn::models::QuizResult;
use letslearn::prompts::QuizFormat;
use letslearn::quiz::QuizReply;
use letslearn::server;
use letslearn::study::StudyService;

/// LetsLearn: a local study assistant over your own documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "letslearn", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/letslearn.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data folder and the projects store. Idempotent; an
    /// existing store is migrated in place.
    Init,

    /// Manage projects and their documents.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Ask a question against a project's documents.
    Ask { project: String, query: String },

    /// Ask about a highlighted passage. No retrieval is involved.
    Explain {
        /// The passage the question refers to.
        #[arg(long)]
        text: String,
        question: String,
    },

    /// Extract the key topics of a project.
    Topics { project: String },

    /// Summarize all of a project's material.
    Summary { project: String },

    /// Study notes for one topic.
    Notes { project: String, topic: String },

    /// Flashcards for a topic (or every topic).
    Flashcards {
        project: String,
        #[arg(long, default_value = "all")]
        topic: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },

    /// Multiple-choice quiz.
    Quiz {
        project: String,
        #[arg(long, default_value = "all")]
        topic: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// `json` (pooled) or `text`.
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Record a quiz result read from a JSON file (`-` for stdin).
    Submit { project: String, file: PathBuf },

    /// Per-topic mastery with levels.
    Mastery { project: String },

    /// Saved images for a project.
    Images { project: String },

    /// Which topics have cached notes, flashcards and quiz pools.
    Cache { project: String },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create an empty project.
    Create { name: String },
    /// Register an existing file with a project and embed it.
    Add { project: String, path: PathBuf },
    /// Embed every registered file of a project.
    Load { project: String },
    /// List projects.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let service = Arc::new(StudyService::from_config(cfg)?);
    service.startup()?;

    match cli.command {
        Commands::Init => {
            println!(
                "Initialized store at {}",
                service.config().storage.projects_file.display()
            );
        }
        Commands::Project { action } => match action {
            ProjectAction::Create { name } => {
                let name = service.create_project(&name)?;
                println!("Project '{}' created.", name);
            }
            ProjectAction::Add { project, path } => {
                let report = service.register_document(&project, &path).await?;
                println!("Embedded {} chunks from {}", report.chunks, report.path.display());
            }
            ProjectAction::Load { project } => {
                let report = service.load_project(&project).await?;
                for file in &report.files {
                    match &file.error {
                        Some(e) => println!("  {:>5} chunks  {} ({})", 0, file.path.display(), e),
                        None => println!("  {:>5} chunks  {}", file.chunks, file.path.display()),
                    }
                }
                println!(
                    "Loaded '{}': {}/{} files, {} chunks",
                    report.project, report.embedded_files, report.total_files, report.chunks
                );
            }
            ProjectAction::List => {
                let projects = service.list_projects()?;
                if projects.is_empty() {
                    println!("No projects.");
                }
                for p in projects {
                    println!(
                        "{}  ({} files, {} results)",
                        p.name,
                        p.loaded_files.len(),
                        p.results
                    );
                }
            }
        },
        Commands::Ask { project, query } => {
            service.load_project(&project).await?;
            print_stream(service.ask(&query).await?).await?;
        }
        Commands::Explain { text, question } => {
            print_stream(service.ask_about_selection(&text, &question).await?).await?;
        }
        Commands::Topics { project } => {
            service.load_project(&project).await?;
            print_stream(service.topics(&project).await?).await?;
        }
        Commands::Summary { project } => {
            service.load_project(&project).await?;
            print_stream(service.summary(&project).await?).await?;
        }
        Commands::Notes { project, topic } => {
            service.load_project(&project).await?;
            print_stream(service.notes(&project, &topic).await?).await?;
        }
        Commands::Flashcards {
            project,
            topic,
            count,
        } => {
            service.load_project(&project).await?;
            print_stream(service.flashcards(&project, &topic, count).await?).await?;
        }
        Commands::Quiz {
            project,
            topic,
            count,
            format,
        } => {
            let format = QuizFormat::parse(&format)
                .with_context(|| format!("unknown quiz format '{}'; use json or text", format))?;
            service.load_project(&project).await?;
            match service.quiz(&project, &topic, count, format).await? {
                QuizReply::Questions(questions) => {
                    println!("{}", serde_json::to_string_pretty(&questions)?);
                }
                QuizReply::Text(stream) => print_stream(stream).await?,
            }
        }
        Commands::Submit { project, file } => {
            let raw = if file.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?
            };
            let result: QuizResult = serde_json::from_str(&raw).context("invalid quiz result")?;
            let mastery = service.submit_result(&project, result)?;
            println!("{}", serde_json::to_string_pretty(&mastery)?);
        }
        Commands::Mastery { project } => {
            let mastery = service.mastery(&project)?;
            if mastery.is_empty() {
                println!("No results recorded yet.");
            }
            for (topic, view) in mastery {
                println!(
                    "{:<30} {:>3}%  {:>3}/{:<3}  {:>5.1} q/min  {:?}",
                    topic,
                    view.record.accuracy,
                    view.record.correct,
                    view.record.attempted,
                    view.record.avg_speed,
                    view.level
                );
            }
        }
        Commands::Images { project } => {
            for (key, image) in service.images(&project)? {
                println!("{}  {}", key, image.path.display());
            }
        }
        Commands::Cache { project } => {
            println!("{}", serde_json::to_string_pretty(&service.cached_keys(&project)?)?);
        }
        Commands::Serve => {
            server::run_server(Arc::clone(&service)).await?;
            return Ok(());
        }
    }

    service.shutdown();
    Ok(())
}

async fn print_stream(mut stream: TextStream) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(fragment) = stream.next().await {
        write!(stdout, "{}", fragment?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

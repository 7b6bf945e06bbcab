use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use atelier_contracts::cache::QueueStore;
use atelier_contracts::events::EventWriter;
use atelier_contracts::models::{classify, is_control_net, validate_base_model, ModelSelector};
use atelier_contracts::queue::GenerationQueue;
use atelier_contracts::request::{GenerationOptions, OutputFormat};
use atelier_engine::{EngineConfig, GenerationReport, Orchestrator, QueueRunner};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Multi-provider image generation pipeline")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image for a stored prompt.
    Generate(GenerateArgs),
    /// Manage and drain the local generation queue.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Inspect model ids.
    #[command(subcommand)]
    Model(ModelCommand),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt_id: String,
    #[command(flatten)]
    options: OptionArgs,
}

#[derive(Debug, Args)]
struct OptionArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    cfg_scale: Option<f64>,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    scheduler: Option<String>,
    /// webp, png or jpg.
    #[arg(long)]
    format: Option<OutputFormat>,
}

impl From<OptionArgs> for GenerationOptions {
    fn from(args: OptionArgs) -> Self {
        GenerationOptions {
            model: args.model,
            width: args.width,
            height: args.height,
            steps: args.steps,
            cfg_scale: args.cfg_scale,
            seed: args.seed,
            scheduler: args.scheduler,
            output_format: args.format,
        }
    }
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    Add {
        #[arg(required = true)]
        prompt_ids: Vec<String>,
    },
    List,
    Remove {
        prompt_id: String,
    },
    Clear,
    /// Generate every pending item, at most GENERATION_CONCURRENCY at a time.
    Run {
        #[command(flatten)]
        options: OptionArgs,
    },
}

#[derive(Debug, Subcommand)]
enum ModelCommand {
    Check { model_id: String },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = EngineConfig::from_env();

    match cli.command {
        Command::Generate(args) => run_generate(&config, args),
        Command::Queue(command) => run_queue(&config, command),
        Command::Model(ModelCommand::Check { model_id }) => run_model_check(&model_id),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        eprintln!("atelier warning: tracing already initialized: {err}");
    }
}

fn orchestrator(config: &EngineConfig) -> Orchestrator {
    let session_id = uuid::Uuid::new_v4().to_string();
    Orchestrator::from_config(config).with_events(EventWriter::new(config.events_path(), session_id))
}

fn run_generate(config: &EngineConfig, args: GenerateArgs) -> Result<i32> {
    let orchestrator = orchestrator(config);
    let options = GenerationOptions::from(args.options);
    let report = orchestrator
        .generate(&args.prompt_id, &options)
        .with_context(|| format!("generation for prompt {} failed", args.prompt_id))?;
    print_json(&report_json(&report))?;
    Ok(0)
}

fn run_queue(config: &EngineConfig, command: QueueCommand) -> Result<i32> {
    let mut queue = GenerationQueue::restore(config.concurrency, QueueStore::new(config.queue_path()));
    match command {
        QueueCommand::Add { prompt_ids } => {
            let added = queue.enqueue(&prompt_ids);
            println!("Queued {added} of {} prompt(s)", prompt_ids.len());
        }
        QueueCommand::List => {
            let items: Vec<Value> = queue
                .items()
                .iter()
                .map(|item| json!({"id": item.id, "status": item.status, "error": item.error}))
                .collect();
            print_json(&json!({
                "concurrency": queue.concurrency(),
                "pending": queue.pending().len(),
                "done": queue.completed().len(),
                "failed": queue.failed().len(),
                "items": items,
            }))?;
        }
        QueueCommand::Remove { prompt_id } => {
            if !queue.remove(&prompt_id) {
                bail!("prompt {prompt_id} is not queued");
            }
            println!("Removed {prompt_id}");
        }
        QueueCommand::Clear => {
            queue.clear();
            println!("Queue cleared");
        }
        QueueCommand::Run { options } => {
            let orchestrator = orchestrator(config);
            let summary =
                QueueRunner::new(&orchestrator, GenerationOptions::from(options)).run(&mut queue);
            let completed: Vec<Value> = summary
                .completed
                .iter()
                .map(|(_, report)| report_json(report))
                .collect();
            let failed: Vec<Value> = summary
                .failed
                .iter()
                .map(|(id, error)| json!({"prompt_id": id, "error": error}))
                .collect();
            print_json(&json!({"completed": completed, "failed": failed}))?;
            if !summary.failed.is_empty() {
                return Ok(2);
            }
        }
    }
    Ok(0)
}

fn run_model_check(model_id: &str) -> Result<i32> {
    let selection = ModelSelector::default().select(Some(model_id));
    let validation = validate_base_model(model_id).map(str::to_string);
    print_json(&json!({
        "model_id": model_id,
        "family": classify(model_id).to_string(),
        "valid": validation.is_ok(),
        "error": validation.as_ref().err().map(ToString::to_string),
        "control_net": is_control_net(model_id),
        "resolved_model": selection.model_id,
        "fallback_reason": selection.fallback_reason,
    }))?;
    Ok(if validation.is_ok() && !is_control_net(model_id) {
        0
    } else {
        2
    })
}

fn report_json(report: &GenerationReport) -> Value {
    json!({
        "outcome": report.outcome.as_str(),
        "outcome_reason": report.outcome.reason(),
        "fallback_reason": report.fallback_reason,
        "record": report.record,
    })
}

fn print_json(value: &Value) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn generate_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "atelier",
            "generate",
            "--prompt-id",
            "p-1",
            "--width",
            "1024",
            "--height",
            "768",
            "--format",
            "jpeg",
            "--model",
            "fal-ai/flux/dev",
        ])
        .unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.prompt_id, "p-1");
        let options = GenerationOptions::from(args.options);
        assert_eq!(options.width, Some(1024));
        assert_eq!(options.height, Some(768));
        assert_eq!(options.output_format, Some(OutputFormat::Jpg));
        assert_eq!(options.model.as_deref(), Some("fal-ai/flux/dev"));
        assert!(options.steps.is_none());
    }

    #[test]
    fn queue_add_requires_ids() {
        assert!(Cli::try_parse_from(["atelier", "queue", "add"]).is_err());
        let cli = Cli::try_parse_from(["atelier", "queue", "add", "p-1", "p-2"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Queue(QueueCommand::Add { prompt_ids }) if prompt_ids == ["p-1", "p-2"]
        ));
    }

    #[test]
    fn bad_format_is_rejected_by_parser() {
        assert!(Cli::try_parse_from([
            "atelier",
            "generate",
            "--prompt-id",
            "p-1",
            "--format",
            "avif"
        ])
        .is_err());
    }
}

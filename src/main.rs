use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use llama_orchestrator::config::EnvOverrides;
use llama_orchestrator::{logging, Config, Specialization, System, Task};
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task and print its result as JSON
    Run {
        /// Free-text task description
        description: String,

        /// Required capability (repeatable)
        #[arg(short = 'r', long = "require")]
        requirements: Vec<String>,

        /// Priority, higher is more urgent
        #[arg(short, long, default_value_t = 1)]
        priority: i32,

        /// Directory to load policies from before and save them to after the run
        #[arg(long)]
        policies: Option<PathBuf>,

        /// Number of agents to consult and aggregate
        #[arg(long)]
        diversity: Option<u64>,
    },
    /// List the default agent pool
    Agents,
    /// Run a mixed batch of tasks and print system metrics
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?
            .apply_env_overrides(&EnvOverrides::from_env())?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    logging::init(&config.log_level)?;

    match cli.command {
        Command::Run {
            description,
            requirements,
            priority,
            policies,
            diversity,
        } => run(config, description, requirements, priority, policies, diversity).await,
        Command::Agents => agents(config).await,
        Command::Demo => demo(config).await,
    }
}

async fn run(
    config: Config,
    description: String,
    requirements: Vec<String>,
    priority: i32,
    policies: Option<PathBuf>,
    diversity: Option<u64>,
) -> Result<()> {
    let system = System::new(config)?;
    system.start().await?;
    if let Some(dir) = &policies {
        let loaded = system.load_policies(dir).await?;
        eprintln!("{} {} policy artifact(s)", "Loaded".bright_blue(), loaded);
    }

    let mut task = Task::new(description)
        .with_requirements(requirements)
        .with_priority(priority);
    if let Some(n) = diversity {
        task = task.with_context("diversity", json!(n));
    }
    let result = system.submit(task).await;

    if let Some(dir) = &policies {
        system.save_policies(dir).await?;
    }
    system.stop().await?;

    let status = if result.success {
        "SUCCESS".bright_green().bold()
    } else {
        "FAILED".bright_red().bold()
    };
    eprintln!("{} task {} on {}", status, result.task_id, result.agent_id.bright_white());
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn agents(config: Config) -> Result<()> {
    let system = System::new(config)?;
    system.start().await?;

    println!("{}", "Registered agents".bright_green().bold());
    let mut states: Vec<_> = system.get_agent_states().into_values().collect();
    states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    for state in states {
        println!(
            "  {:<22} {}",
            state.agent_id.bright_white().bold(),
            state.capabilities.join(", ").bright_blue()
        );
    }
    Ok(())
}

async fn demo(mut config: Config) -> Result<()> {
    config.pool.default_agents = Specialization::ALL.to_vec();
    let system = System::new(config)?;
    system.start().await?;

    let batch: Vec<(&str, Vec<String>, i32)> = vec![
        ("Research async runtimes in Rust", vec![], 2),
        ("Implement and test a tokenizer", vec![], 3),
        ("Summarize quarterly budget", vec!["finance".into()], 1),
        ("Research and code a prototype", vec!["research".into(), "code".into()], 5),
        ("Say hello", vec![], 1),
    ];

    let runs = batch.into_iter().map(|(description, requirements, priority)| {
        let system = system.clone();
        async move {
            let result = system.execute_task(description, &requirements, priority).await;
            (description, result)
        }
    });
    for (description, result) in futures::future::join_all(runs).await {
        let marker = if result.success {
            "ok".bright_green()
        } else {
            "failed".bright_red()
        };
        println!("[{}] {:<40} -> {}", marker, description, result.agent_id.bright_white());
    }

    let metrics = system.get_metrics().await;
    system.stop().await?;
    println!("\n{}", "System metrics".bright_yellow().bold());
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

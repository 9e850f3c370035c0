use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "kafka-ha")]
#[command(about = "Kafka high-availability scenario runner", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more failure scenarios
    Run {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,

        /// Scenario to run (repeatable, see `kafka-ha scenarios`)
        #[arg(short, long, required_unless_present = "all")]
        scenario: Vec<String>,

        /// Run every scenario in the catalogue
        #[arg(long, conflicts_with = "scenario")]
        all: bool,

        /// Run against the in-memory cluster model instead of a real cluster
        #[arg(long, default_value = "false")]
        simulate: bool,

        /// Read the topic back after each run and audit every acked record
        #[arg(long, default_value = "false")]
        read_back: bool,

        /// Output format (text, json, yaml)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the scenario catalogue
    Scenarios {
        /// Path to a configuration file whose timings should be shown
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Show the leader and in-sync replicas of the harness topic
    Describe {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,

        /// Ask this unit index instead of any member
        #[arg(short, long)]
        unit: Option<u32>,

        /// Output format (text, json, yaml)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the high-water mark of every partition of the harness topic
    Offsets {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,

        /// Ask this unit index instead of any member
        #[arg(short, long)]
        unit: Option<u32>,

        /// Output format (text, json, yaml)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Undo every perturbation the harness can apply
    Cleanup {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    // Priority: RUST_LOG env var > verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            config,
            scenario,
            all,
            simulate,
            read_back,
            format,
        } => {
            let options = commands::run::RunOptions {
                scenarios: scenario,
                all,
                simulate,
                read_back,
                format: commands::OutputFormat::from(format.as_str()),
            };
            commands::run::run(&config, options).await?;
        }
        Commands::Scenarios { config } => {
            commands::scenarios::run(config.as_deref()).await?;
        }
        Commands::Describe {
            config,
            unit,
            format,
        } => {
            commands::describe::run(&config, unit, commands::OutputFormat::from(format.as_str()))
                .await?;
        }
        Commands::Offsets {
            config,
            unit,
            format,
        } => {
            commands::offsets::run(&config, unit, commands::OutputFormat::from(format.as_str()))
                .await?;
        }
        Commands::Cleanup { config } => {
            commands::cleanup::run(&config).await?;
        }
        Commands::ValidateConfig { config } => {
            commands::validate_config::run(&config).await?;
        }
    }

    Ok(())
}

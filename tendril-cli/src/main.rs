use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tendril_core::{LoggingConfig, TendrilConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;

use commands::{
    cmd_config, cmd_hooks, cmd_list, cmd_order, cmd_validate, OutputFormat, PluginSource,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tendril")]
#[command(version = VERSION)]
#[command(about = "Tendril - plugin runtime operator tooling")]
#[command(long_about = r#"
Tendril loads, sequences and supervises plugins described by a manifest
(tendril-plugin.toml, .json or .yaml) inside each plugin directory.

Use 'tendril validate' to check manifests, 'tendril list' to see what is
installed, and 'tendril order' to print the dependency-resolved load order.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true, help = "Configuration file to load")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate a manifest file or every plugin in a directory")]
    Validate {
        #[arg(help = "Manifest file or plugin directory (defaults to the plugins dir)")]
        path: Option<PathBuf>,

        #[arg(long, help = "Also check declared capabilities against configured grants")]
        grants: bool,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    #[command(about = "List plugins found in the plugins directory")]
    List {
        #[arg(short, long, help = "Plugins directory to scan")]
        dir: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    #[command(about = "Print the dependency-resolved load order")]
    Order {
        #[arg(short, long, help = "Plugins directory to scan")]
        dir: Option<PathBuf>,

        #[arg(long, help = "Print the shutdown order instead")]
        reverse: bool,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    #[command(about = "List hooks declared by plugins and their subscribers")]
    Hooks {
        #[arg(short, long, help = "Plugins directory to scan")]
        dir: Option<PathBuf>,

        #[arg(help = "Only show this hook")]
        name: Option<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    #[command(about = "Show the effective configuration (TOML, or JSON with --format json)")]
    Config {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_logging(cli.verbose, &LoggingConfig::default());
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(cli.verbose, &config.logging);

    match run(cli.command, config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json_format {
        registry
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

async fn run(command: Commands, config: TendrilConfig) -> anyhow::Result<()> {
    match command {
        Commands::Validate {
            path,
            grants,
            format,
        } => {
            let source = PluginSource::from_arg(path, &config);
            cmd_validate(&source, grants.then_some(&config), format).await
        }
        Commands::List { dir, format } => {
            cmd_list(&PluginSource::from_arg(dir, &config), format).await
        }
        Commands::Order {
            dir,
            reverse,
            format,
        } => cmd_order(&PluginSource::from_arg(dir, &config), reverse, format).await,
        Commands::Hooks { dir, name, format } => {
            cmd_hooks(&PluginSource::from_arg(dir, &config), name.as_deref(), format).await
        }
        Commands::Config { format } => cmd_config(&config, format),
    }
}

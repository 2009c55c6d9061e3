mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, rules::RulesSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ruleflow",
    about = "Rule engine for work-item tracker events: evaluate rules, apply actions, convert legacy rules",
    version,
    propagate_version = true
)]
struct Cli {
    /// Working root (default: nearest directory holding ruleflow.yaml)
    #[arg(long, global = true, env = "RULEFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server
    Serve {
        /// Port to listen on (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Evaluate the stored rules against an event file without touching the tracker
    Run {
        /// Path to a webhook event JSON file
        event: PathBuf,
    },

    /// Convert legacy rule blocks into expression rules
    Convert {
        /// Legacy rules file
        file: PathBuf,
        /// Rule set for the converted rules
        #[arg(long, default_value = "ConvertedRules")]
        rule_set: String,
        /// Priority for the converted rules
        #[arg(long)]
        priority: Option<i32>,
        /// Field written by calculation rules that assign nothing themselves
        #[arg(long)]
        size_field: Option<String>,
        /// Store the converted rules as well as printing them
        #[arg(long)]
        save: bool,
    },

    /// Import legacy rule blocks unchanged as script rules
    Import {
        /// Legacy rules file
        file: PathBuf,
        /// Rule set to import into
        #[arg(long)]
        rule_set: String,
        /// Priority for the imported rules
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Inspect stored rules
    Rules {
        #[command(subcommand)]
        subcommand: RulesSubcommand,
    },

    /// Inspect and validate ruleflow.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Serve { port, bind } => cmd::serve::run(&root, port, bind),
        Commands::Run { event } => cmd::run::run(&root, &event, cli.json),
        Commands::Convert {
            file,
            rule_set,
            priority,
            size_field,
            save,
        } => cmd::convert::run(
            &root,
            &file,
            cmd::convert::Options {
                rule_set,
                priority,
                size_field,
                save,
            },
            cli.json,
        ),
        Commands::Import {
            file,
            rule_set,
            priority,
        } => cmd::import::run(&root, &file, &rule_set, priority, cli.json),
        Commands::Rules { subcommand } => cmd::rules::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

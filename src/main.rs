//! `gt` - Gas Town dashboard CLI.

use clap::Parser;
use gastown::cli::{Cli, Commands};
use gastown::commands::{self, Output};
use gastown::config;
use std::path::Path;
use std::process;
use tracing_subscriber::EnvFilter;

/// Log filter variable checked before `RUST_LOG`.
const LOG_ENV: &str = "GT_LOG";

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;
    init_logging(cli.log_json);

    let result = config::find_town_root(cli.town_root.as_deref())
        .and_then(|town_root| run_command(cli.command, &town_root, human));

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            if human {
                eprintln!("Error: {}", e);
            } else {
                eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
            }
            process::exit(1);
        }
    }
}

/// Initialize tracing on stderr: `GT_LOG`, then `RUST_LOG`, then `info`.
fn init_logging(json: bool) {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

/// Run a command; `Ok(false)` means it completed but found problems.
fn run_command(command: Commands, town_root: &Path, human: bool) -> Result<bool, gastown::Error> {
    match command {
        #[cfg(feature = "web")]
        Commands::Serve {
            host,
            port,
            poll_interval,
            dev,
        } => {
            serve(
                town_root,
                config::ServeOverrides {
                    host,
                    port,
                    poll_interval_secs: poll_interval,
                },
                dev,
            )?;
            Ok(true)
        }
        Commands::Status { fast } => {
            let result = commands::status(town_root, fast)?;
            output(&result, human);
            Ok(true)
        }
        Commands::Doctor { fix, check } => {
            let result = commands::doctor(town_root, fix, check.as_deref())?;
            output(&result, human);
            Ok(result.ok())
        }
    }
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

/// Run the dashboard server until a shutdown signal.
#[cfg(feature = "web")]
fn serve(
    town_root: &Path,
    overrides: config::ServeOverrides,
    dev: bool,
) -> Result<(), gastown::Error> {
    let town_config = config::load_town_config_soft(town_root);
    let settings = config::resolve_serve(&town_config.serve, &overrides);

    let options = gastown::web::ServeOptions {
        town_root: town_root.to_path_buf(),
        settings,
        dev,
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| gastown::Error::Other(format!("Failed to create runtime: {}", e)))?
        .block_on(gastown::web::start_server(options))
}

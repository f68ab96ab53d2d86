//! Terminal front end for code sessions.
//!
//! Run with: cargo run -p coderun-cli -- --project ./my-project run
//!
//! The project directory plays the role of the virtual file store: the
//! entry point, `.coderun/coderun.json` and received files all live there.

use std::{collections::BTreeMap, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use coderun_core::{
    ConsoleEvent, ConsoleLine, ConsoleLog, ExecutionState, LineKind, ProjectConfig, ProjectContext,
};
use coderun_executor::{CommandBuilder, LocalDriver, ProcessInterpreter};
use coderun_session::{DiskFileStore, Multiplexer, ServiceSelection};
use coderun_transport::WsConnector;
use futures::{StreamExt, stream::BoxStream};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "coderun",
    version,
    about = "Run a project locally or bridged to a remote grading service",
    after_help = "Examples:\n  \
        coderun --project ./sum run\n  \
        coderun --project ./sum connect --problem sum --service eval --arg size=small\n  \
        coderun --project ./sum connect --service eval --file input=/data/in.txt"
)]
struct Cli {
    /// Project directory
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Settings document path inside the project
    #[arg(long)]
    config: Option<String>,

    /// Remote service endpoint (overrides SERVER)
    #[arg(long)]
    server: Option<String>,

    /// Auth token (overrides TOKEN)
    #[arg(long, env = "CODERUN_TOKEN")]
    token: Option<String>,

    /// Interpreter command line
    #[arg(long, default_value = "python3 -u")]
    interpreter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the default settings document
    Init,

    /// Run the entry point locally
    Run,

    /// Connect to a remote service and run the entry point against it
    Connect {
        /// Problem name (defaults to PROBLEM)
        #[arg(long)]
        problem: Option<String>,

        /// Service name (defaults to SERVICE)
        #[arg(long)]
        service: Option<String>,

        /// Service argument, as key=value
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// File argument, as name=path
        #[arg(short, long = "file", value_parser = parse_file_arg)]
        files: Vec<(String, String)>,
    },
}

fn parse_file_arg(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, path)| (name.to_owned(), path.to_owned()))
        .filter(|(name, path)| !name.is_empty() && !path.is_empty())
        .ok_or_else(|| format!("expected name=path, got {raw}"))
}

fn print_line(line: &ConsoleLine) {
    match line.kind {
        LineKind::Stdout => println!("{}", line.text),
        LineKind::Stderr => eprintln!("{}", line.text),
        LineKind::System => println!("[{}]", line.text),
        LineKind::StdinFromRemote => println!("<< {}", line.text),
        // Already visible as typed.
        LineKind::Stdin => {}
    }
}

/// Print console events until every sender is gone.
async fn print_console(mut events: BoxStream<'static, ConsoleEvent>) {
    while let Some(event) = events.next().await {
        match event {
            ConsoleEvent::Line(line) => print_line(&line),
            ConsoleEvent::StdinEnabled(enabled) => tracing::debug!(enabled, "Input prompt"),
            ConsoleEvent::Cleared => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let files = Arc::new(DiskFileStore::new(&cli.project));
    let mut config = ProjectConfig::load(files.as_ref(), cli.config.as_deref())
        .await
        .context("Failed to load project settings")?
        .unwrap_or_default();
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(token) = cli.token {
        config.token = token;
    }

    let selection = match cli.command {
        Command::Init => {
            config
                .save(files.as_ref())
                .await
                .context("Failed to write project settings")?;
            println!("Wrote {}", config.config_path());
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run => None,
        Command::Connect {
            problem,
            service,
            args,
            files: file_args,
        } => {
            let problem = problem.unwrap_or_else(|| config.problem.clone());
            let service = service.unwrap_or_else(|| config.service.clone());
            if problem.is_empty() || service.is_empty() {
                bail!("--problem and --service are required when PROBLEM/SERVICE are unset");
            }
            Some(ServiceSelection {
                problem,
                service,
                args,
                file_args: file_args.into_iter().collect::<BTreeMap<_, _>>(),
            })
        }
    };

    let console = Arc::new(ConsoleLog::new());
    let printer = tokio::spawn(print_console(console.history_plus_stream()));
    let (mux, driver) = open_session(config, files, Arc::clone(&console), cli.interpreter);

    let started = match selection {
        None => mux.run().await.is_ok(),
        Some(selection) => {
            mux.select_service(Some(selection));
            mux.connect().await.is_ok()
        }
    };
    let outcome = if started {
        interact(&mux, &driver).await
    } else {
        ExecutionState::Error {
            message: "session did not start".into(),
        }
    };
    mux.stop_all();

    // The printer ends once the last console handle is dropped.
    drop(mux);
    drop(driver);
    drop(console);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    Ok(match outcome {
        ExecutionState::Error { .. } => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

fn open_session(
    config: ProjectConfig,
    files: Arc<DiskFileStore>,
    console: Arc<ConsoleLog>,
    interpreter: String,
) -> (Multiplexer, Arc<LocalDriver>) {
    let interpreter = ProcessInterpreter::new(
        CommandBuilder::new(interpreter),
        files.root().to_path_buf(),
    );
    let (driver, driver_events) = LocalDriver::new(Arc::new(interpreter), files.clone());
    let driver = Arc::new(driver);
    let connector =
        WsConnector::new(config.server.clone()).with_timeout(config.connect_timeout());
    tracing::debug!(server = %config.server, root = %files.root().display(), "Opening session");

    let ctx = ProjectContext::new(config, files, console);
    let mux = Multiplexer::spawn(ctx, Arc::clone(&driver), driver_events, Arc::new(connector));
    (mux, driver)
}

/// Feed terminal input to the session until the run ends and the remote
/// session is done.
async fn interact(mux: &Multiplexer, driver: &LocalDriver) -> ExecutionState {
    let mut state = driver.watch_state();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        let current = state.borrow_and_update().clone();
        if current.is_terminal() && !mux.is_remote_active() {
            return current;
        }

        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return driver.state();
                }
            }
            line = input.next_line(), if input_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = mux.send_stdin(&line) {
                        tracing::warn!("{e}");
                    }
                }
                Ok(None) => input_open = false,
                Err(e) => {
                    tracing::warn!("Failed to read terminal input: {e}");
                    input_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                mux.stop_all();
                return driver.state();
            }
            _ = tick.tick() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use coderun_core::ConsoleSink;

    use super::*;

    #[tokio::test]
    async fn test_printer_ends_with_console() {
        let console = Arc::new(ConsoleLog::new());
        let printer = tokio::spawn(print_console(console.history_plus_stream()));
        console.stdout("2+2=");
        console.set_stdin_enabled(true);
        drop(console);

        tokio::time::timeout(Duration::from_secs(5), printer)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_parse_file_arg() {
        assert_eq!(
            parse_file_arg("input=/data/in.txt"),
            Ok(("input".into(), "/data/in.txt".into()))
        );
        assert!(parse_file_arg("input").is_err());
        assert!(parse_file_arg("=/x").is_err());
    }

    #[test]
    fn test_cli_parses_connect() {
        let cli = Cli::parse_from([
            "coderun",
            "--project",
            "/tmp/p",
            "connect",
            "--problem",
            "sum",
            "--service",
            "eval",
            "-a",
            "size=small",
            "-f",
            "input=/data/in.txt",
        ]);
        let Command::Connect {
            problem,
            args,
            files,
            ..
        } = cli.command
        else {
            panic!("expected connect");
        };
        assert_eq!(problem.as_deref(), Some("sum"));
        assert_eq!(args, vec!["size=small"]);
        assert_eq!(files, vec![("input".to_owned(), "/data/in.txt".to_owned())]);
    }
}

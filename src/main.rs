use clap::{Parser, Subcommand};
use htmlshot::platform::{self, Platform};
use htmlshot::{delete_artifact, RenderConfig, Renderer, RetryPolicy, Viewport};
use log::error;
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "htmlshot", version, about = "Render HTML to PNG with a headless browser")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Enable debug logging")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render an HTML document to a PNG screenshot
    Render {
        #[arg(long, short, help = "HTML file to render (stdin if omitted)")]
        input: Option<PathBuf>,

        #[arg(long, default_value = "800x600", help = "Viewport dimensions (WIDTHxHEIGHT)")]
        viewport: Viewport,

        #[arg(long, default_value = htmlshot::config::DEFAULT_OUTPUT_DIR, help = "Directory screenshots are written to")]
        output_dir: PathBuf,

        #[arg(long, env = "HTMLSHOT_BROWSER", help = "Browser executable (overrides platform discovery)")]
        browser: Option<PathBuf>,

        #[arg(long, default_value_t = 3, help = "Maximum render attempts")]
        attempts: u32,

        #[arg(long, default_value_t = 1000, help = "Delay between attempts (milliseconds)")]
        delay_ms: u64,

        #[arg(long, default_value_t = 60, help = "Deadline for a single attempt (seconds)")]
        timeout_secs: u64,

        #[arg(long, default_value_t = 500, help = "Quiet period that counts as network idle (milliseconds)")]
        network_idle_ms: u64,

        #[arg(long, help = "Print a JSON object instead of the bare path")]
        json: bool,
    },
    /// Delete a previously rendered screenshot
    Delete { path: PathBuf },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderOutput {
    path: PathBuf,
    width: u32,
    height: u32,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", default_filter))
        .try_init();
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Render {
            input,
            viewport,
            output_dir,
            browser,
            attempts,
            delay_ms,
            timeout_secs,
            network_idle_ms,
            json,
        } => {
            // Resolved once, before any render
            let executable = match browser {
                Some(path) => Some(path),
                None => platform::resolve_executable(&Platform::current())?,
            };

            let html = read_html(input.as_ref()).await?;
            let config = RenderConfig {
                executable,
                output_dir,
                retry: RetryPolicy {
                    max_attempts: attempts,
                    delay: Duration::from_millis(delay_ms),
                },
                attempt_timeout: Duration::from_secs(timeout_secs),
                network_idle: Duration::from_millis(network_idle_ms),
                ..RenderConfig::default()
            };

            let started = Instant::now();
            let path = Renderer::chrome(config).render(&html, viewport).await?;

            if json {
                let out = RenderOutput {
                    path,
                    width: viewport.width,
                    height: viewport.height,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                println!("{}", serde_json::to_string(&out)?);
            } else {
                println!("{}", path.display());
            }
            Ok(())
        }
        Commands::Delete { path } => {
            delete_artifact(&path).await?;
            Ok(())
        }
    }
}

async fn read_html(input: Option<&PathBuf>) -> anyhow::Result<String> {
    match input {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => {
            let mut html = String::new();
            std::io::stdin().read_to_string(&mut html)?;
            Ok(html)
        }
    }
}

mod face;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use usagi::hands::{ChromeOptions, ChromeSession};
use usagi::{Brain, CrawlConfig, CrawlEvent, Crawler, Credentials, ModelSettings};

/// Explore a web site with an LLM choosing one action at a time.
#[derive(Debug, Parser)]
#[command(name = "usagi", version)]
struct Args {
    /// Page the crawl starts from.
    url: String,

    /// What the crawl should try to achieve.
    #[arg(long, default_value = "Explore the site and discover as many distinct pages and states as possible")]
    goal: String,

    #[arg(long, env = "USAGI_MAX_STEPS")]
    max_steps: Option<usize>,

    #[arg(long, env = "USAGI_MAX_REVISITS")]
    max_revisits: Option<usize>,

    #[arg(long, env = "USAGI_STEP_TIMEOUT_MS")]
    step_timeout_ms: Option<u64>,

    #[arg(long, env = "USAGI_FAILURE_BUDGET")]
    failure_budget: Option<usize>,

    /// Run Chrome without a window.
    #[arg(long)]
    headless: bool,

    /// Always launch a fresh Chrome instead of attaching to one on port 9222.
    #[arg(long)]
    no_attach: bool,

    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Serve a live progress page on this port.
    #[arg(long)]
    serve: Option<u16>,

    /// Print the full outcome as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut CrawlConfig) {
        if let Some(v) = self.max_steps {
            config.max_steps = v;
        }
        if let Some(v) = self.max_revisits {
            config.max_revisits = v;
        }
        if let Some(v) = self.step_timeout_ms {
            config.step_timeout_ms = v;
        }
        if let Some(v) = self.failure_budget {
            config.failure_budget = v;
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("usagi=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = Args::parse();
    init_logging(args.log_json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("usagi: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = CrawlConfig::from_env()?;
    args.apply(&mut config);
    config.validate()?;

    let brain = Brain::from_credentials(&Credentials::from_env(), &ModelSettings::from_env(), &config)?;

    let (events, _) = broadcast::channel::<CrawlEvent>(256);
    if let Some(port) = args.serve {
        face::serve(port, events.clone()).await?;
    }

    let options = ChromeOptions {
        headless: args.headless,
        chrome_path: args.chrome_path.clone(),
        profile_dir: None,
        attach: !args.no_attach,
    };
    info!(headless = options.headless, "Launching Chrome");
    let session = tokio::task::spawn_blocking(move || ChromeSession::launch(&options))
        .await
        .context("browser launch panicked")??;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            on_signal.cancel();
        }
    });

    let outcome = Crawler::new(&session, brain, config)
        .with_cancellation(cancel)
        .with_events(events)
        .run(&args.url, &args.goal)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!(
            "{:?} after {} steps, {} distinct states, {} transitions, {} elements tried, provider {}",
            outcome.reason,
            outcome.steps_taken,
            outcome.states_discovered,
            outcome.transitions.len(),
            outcome.elements_interacted,
            outcome.provider
        );
        for step in outcome.history.recent() {
            println!("  {}", step.summary_line());
        }
        if let Some(fp) = &outcome.final_fingerprint {
            println!("final state {}", fp.short());
        }
    }
    Ok(())
}

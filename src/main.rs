use std::io::{self, Write};
use std::path::Path;

use clap::Parser;
use colored::*;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use pagecast::cli::Args;
use pagecast::config::Config;
use pagecast::error::PagecastError;
use pagecast::fence::FenceState;
use pagecast::generate::{GenerateRequest, Generator, TokenStream};
use pagecast::session::{Outcome, Preview, Session};
use pagecast::web;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    if args.serve {
        web::serve(config).await?;
        return Ok(());
    }

    let prompt = args.prompt.clone().unwrap_or_default();
    print_header(&config, &prompt, args.remote.as_deref());

    let tokens = match &args.remote {
        Some(base) => web::remote_tokens(base, &prompt, config.upstream.api_key.as_deref()).await?,
        None => open_direct(&config, prompt).await?,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_previews(rx, args.raw));
    let outcome = Session::new(config.extract).with_previews(tx).drive(tokens).await;
    // The session drops its sender when it finishes, which ends the renderer.
    let _ = renderer.await;
    let outcome = outcome?;

    report(&outcome);
    write_content(&outcome.extraction.content, args.output.as_deref())?;
    Ok(())
}

async fn open_direct(config: &Config, prompt: String) -> Result<TokenStream, PagecastError> {
    let request = GenerateRequest {
        prompt: Some(prompt),
        api_key: None,
    }
    .resolve(false, config.upstream.api_key.as_deref())?;
    if request.credential.is_none() {
        tracing::warn!("no API key configured; set OPENAI_API_KEY or upstream.api_key");
    }
    Generator::new(&config.upstream)?.stream(&request).await
}

async fn render_previews(mut rx: mpsc::UnboundedReceiver<Preview>, raw: bool) {
    let mut last_state = FenceState::SeekingOpen;
    while let Some(preview) = rx.recv().await {
        if raw {
            print!("{}", preview.token);
            let _ = io::stdout().flush();
            continue;
        }
        if preview.state != last_state {
            let label = match preview.state {
                FenceState::SeekingOpen => "waiting for fence".normal(),
                FenceState::InsideFence => "inside fence".bright_cyan(),
                FenceState::Closed => "fence closed".bright_green(),
            };
            eprint!("\r\x1b[K");
            eprintln!("  {} after {} tokens", label, preview.index + 1);
            last_state = preview.state;
        }
        eprint!(
            "\r\x1b[K  {} tokens, {} chars extracted",
            (preview.index + 1).to_string().bright_white(),
            preview.content.chars().count().to_string().bright_white()
        );
    }
    eprintln!();
}

fn print_header(config: &Config, prompt: &str, remote: Option<&str>) {
    eprintln!("{}", "PAGECAST".bright_cyan().bold());
    match remote {
        Some(base) => eprintln!("{}: {}", "Remote".bright_yellow(), base),
        None => eprintln!("{}: {}", "Model".bright_yellow(), config.upstream.model),
    }
    eprintln!(
        "{}: {} / {} / close break: {}",
        "Fence".bright_yellow(),
        config.extract.fence,
        config.extract.on_unclosed,
        config.extract.close_break
    );
    eprintln!("{}: {}", "Prompt".bright_yellow(), prompt);
    eprintln!("{}", "-".repeat(40).bright_blue());
}

fn report(outcome: &Outcome) {
    if outcome.truncated {
        eprintln!(
            "{}",
            "  warning: the stream was cut short, the result may be incomplete".bright_red()
        );
    }
    if !outcome.extraction.complete {
        eprintln!(
            "{}",
            format!("  warning: no closing fence ({:?})", outcome.extraction.state).bright_yellow()
        );
    }
    eprintln!(
        "{}",
        format!(
            "  {} tokens, {} chars extracted",
            outcome.tokens,
            outcome.extraction.content.chars().count()
        )
        .bright_green()
    );
}

fn write_content(content: &str, output: Option<&Path>) -> Result<(), PagecastError> {
    match output {
        Some(path) => {
            std::fs::write(path, content)?;
            eprintln!("{}", format!("  wrote {}", path.display()).bright_green());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(content.as_bytes())?;
            if !content.ends_with('\n') {
                stdout.write_all(b"\n")?;
            }
            stdout.flush()?;
        }
    }
    Ok(())
}

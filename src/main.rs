use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use pageprep::{prepare, PrepConfig, Settled};

/// Prepare a server-rendered HTML page for headless screenshot capture.
///
/// Reads a page, resolves `data-background-image` / `data-src` references
/// into local handles, flags `<body>` with the `done` class, and writes the
/// prepared page out.
#[derive(Parser)]
#[command(name = "pageprep", version, about)]
struct Cli {
    /// Input HTML file, or `-` for stdin
    input: String,

    /// Write the prepared page here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Base URL for resolving relative resource references
    #[arg(long)]
    base_url: Option<String>,

    /// Emit a self-contained page with resources inlined as data: URLs
    #[arg(long)]
    inline: bool,

    /// Print the per-plugin outcome list as JSON to stderr
    #[arg(long)]
    report: bool,

    /// Override the request user agent
    #[arg(long)]
    user_agent: Option<String>,

    /// Per-request timeout in milliseconds (default: none)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Also write the prepared page to this path, for debugging templates
    #[arg(long)]
    dump_html: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let html = if cli.input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        buf
    } else {
        std::fs::read_to_string(&cli.input)
            .with_context(|| format!("reading `{}`", cli.input))?
    };

    let mut config = PrepConfig {
        base_url: cli.base_url,
        timeout_ms: cli.timeout_ms,
        ..Default::default()
    };
    if let Some(ua) = cli.user_agent {
        config.user_agent = ua;
    }

    let prepared = prepare(&html, config).await?;

    let out = if cli.inline {
        prepared.inlined_html()
    } else {
        prepared.html()
    };

    if let Some(path) = &cli.dump_html {
        std::fs::write(path, &out).with_context(|| format!("writing `{}`", path.display()))?;
    }

    match &cli.output {
        Some(path) => {
            std::fs::write(path, &out).with_context(|| format!("writing `{}`", path.display()))?
        }
        None => print!("{out}"),
    }

    if cli.report {
        eprintln!("{}", serde_json::to_string_pretty(prepared.outcomes())?);
    }

    let failed = prepared
        .outcomes()
        .iter()
        .filter(|o| matches!(o.settled, Settled::Failed(_)))
        .count();
    if failed > 0 {
        eprintln!(
            "pageprep: {failed} of {} plugin(s) failed; page flagged done anyway",
            prepared.outcomes().len()
        );
    }

    Ok(())
}

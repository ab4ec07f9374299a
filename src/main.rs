use anyhow::{anyhow, Context};
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use tg_fanout::config::Settings;
use tg_fanout::controller::RunController;
use tg_fanout::dispatcher::DispatchTiming;
use tg_fanout::job::RunSpec;
use tg_fanout::report::ChatReportSink;
use tg_fanout::source::{HttpRecipientSource, RecipientSource, UnconfiguredSource};
use tg_fanout::state::FileStateStore;
use tg_fanout::transport::{TelegramTransport, Transport};
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting the bot token from log output
struct RedactionPatterns {
    token_in_url: Regex,
    bare_token: Regex,
}

impl RedactionPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_in_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)")?,
            bare_token: Regex::new(r"[0-9]{8,10}:[A-Za-z0-9_-]{35}")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self
            .token_in_url
            .replace_all(input, "$1[TELEGRAM_TOKEN]")
            .to_string();
        self.bare_token
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string()
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        self.inner.write_all(self.patterns.redact(&s).as_bytes())?;
        // Report the original length even though the redacted text may differ.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter {
    patterns: Arc<RedactionPatterns>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: Arc::clone(&self.patterns),
        }
    }
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(RedactingMakeWriter { patterns }))
        .init();
}

fn load_job() -> anyhow::Result<(RunSpec, Option<Duration>)> {
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or_else(|| anyhow!("usage: tg-fanout <job.json> [delay-seconds]"))?;
    let delay = args
        .next()
        .map(|s| s.parse::<u64>().map(Duration::from_secs))
        .transpose()
        .context("delay must be whole seconds")?;

    let body = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let spec: RunSpec = serde_json::from_str(&body).with_context(|| format!("parsing {path}"))?;
    Ok((spec, delay))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new()?);
    init_logging(patterns);

    info!("Starting tg-fanout broadcast engine...");

    let settings = match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (spec, delay) = load_job()?;

    let store = Arc::new(FileStateStore::load(settings.state_file()).await?);
    info!("State store ready at {}", settings.state_file());

    let telegram = Arc::new(TelegramTransport::new(Bot::new(
        settings.telegram_token.clone(),
    )));
    let transport: Arc<dyn Transport> = telegram.clone();
    let chat_sink: Arc<dyn ChatReportSink> = telegram;

    let source: Arc<dyn RecipientSource> = match &settings.recipient_source_url {
        Some(url) => Arc::new(HttpRecipientSource::new(reqwest::Client::new(), url.clone())),
        // jobs carrying testRecipients never page; anything else fails fast
        None => Arc::new(UnconfiguredSource),
    };

    let controller = RunController::new(
        store,
        transport,
        chat_sink,
        source,
        DispatchTiming::default(),
    );

    let receipt = controller.submit(spec, delay).await?;
    let run_id = receipt.run_id.clone();
    info!(run_id = %run_id, "run accepted; Ctrl-C cancels");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(run_id = %run_id, "interrupt received, cancelling run");
            controller.cancel(&run_id).await?;
            controller.wait(&run_id).await;
        }
        () = controller.wait(&run_id) => {}
    }

    match controller.status(&run_id).await {
        Some(status) => info!(run_id = %run_id, ?status, "run finished"),
        None => error!(run_id = %run_id, "run vanished from the registry"),
    }
    Ok(())
}

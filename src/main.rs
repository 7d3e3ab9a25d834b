//! phaseflow - Entry Point
//!
//! Reads a coding-agent NDJSON status stream from stdin, logs every message
//! and prints a run summary on EOF.
//!
//! Usage: `claude -p "..." --output-format stream-json --verbose | phaseflow`

use async_trait::async_trait;
use phaseflow::agent::MessageHandler;
use phaseflow::{Config, ProcessMessage, ProcessOutputParser};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Logs each message as it arrives
struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, message: ProcessMessage) {
        match message.kind.as_str() {
            "assistant" => {
                let text = message.text().unwrap_or_default();
                info!(kind = %message.kind, "{}", text.chars().take(200).collect::<String>());
            }
            "result" => info!(kind = %message.kind, subtype = ?message.subtype, cost = ?message.cost, "Run finished"),
            "error" => warn!(kind = %message.kind, "{}", message.text().unwrap_or_default()),
            _ => debug!(kind = %message.kind, subtype = ?message.subtype, "Status message"),
        }
    }
}

/// `RUST_LOG` directives, falling back to `info` when unset or unparsable
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("phaseflow v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: <agent command> | phaseflow [--flush]");
        println!();
        println!("Options:");
        println!("  --flush      Decode a final line that has no trailing newline");
        println!("  --help, -h   Show this help");
        println!();
        println!("Environment variables:");
        println!("  RUST_LOG                 Log filter, e.g. phaseflow=debug (default: info)");
        println!("  PHASEFLOW_LOG_FORMAT     json (default) or pretty");
        println!("  PHASEFLOW_HANDLER_QUEUE  Handler queue capacity (default: 256)");
        return Ok(());
    }
    let flush = args.iter().any(|a| a == "--flush");

    let rust_log = std::env::var("RUST_LOG").ok();

    // stdout carries the summary, so logs always go to stderr
    if std::env::var("PHASEFLOW_LOG_FORMAT").is_ok_and(|f| f == "pretty") {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(log_filter(rust_log.as_deref()))
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(log_filter(rust_log.as_deref()))
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    info!("phaseflow v{} reading stdin", env!("CARGO_PKG_VERSION"));

    let mut parser = ProcessOutputParser::with_handler(Arc::new(LogHandler), config.handler_queue_capacity);
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 8192];
    let mut decoded = 0usize;

    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoded += parser.feed_bytes(&buf[..n]).await.len();
    }

    if flush {
        decoded += parser.flush().await.len();
    } else if parser.pending() > 0 {
        warn!("Discarding {} bytes of incomplete trailing line", parser.pending());
    }

    let session = parser.session_id().unwrap_or("-").to_string();
    let cost = parser.total_cost();
    let assistant = parser.message_count();
    let elapsed = parser.elapsed();
    parser.close().await;

    println!("session:             {}", session);
    println!("messages:            {}", decoded);
    println!("assistant messages:  {}", assistant);
    println!("cost:                ${:.4}", cost);
    println!("duration:            {:.1}s", elapsed.as_secs_f64());

    Ok(())
}

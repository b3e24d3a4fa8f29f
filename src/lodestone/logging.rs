use std::{fs, io};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::lodestone::config::{LogFormat, LogOutput, LoggingConfig};

/// Installs the global tracing subscriber. The returned guard flushes the
/// non-blocking writer; keep it alive for the process lifetime.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    // Config loading vetted the level; RUST_LOG still overrides it wholesale.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(&cfg.level).context("logging: init filter")?,
    };

    let (writer, guard) = writer_for(&cfg.output)?;
    // ANSI colour only makes sense on a terminal stream.
    let ansi = matches!(cfg.output, LogOutput::Stderr | LogOutput::Stdout);

    match cfg.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true),
            )
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .init(),
    }

    Ok(guard)
}

fn writer_for(output: &LogOutput) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    Ok(match output {
        LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
        LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
        LogOutput::Discard => tracing_appender::non_blocking(io::sink()),
        LogOutput::File(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
    })
}

// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Logging setup with a reloadable level filter

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, reload};

/// Directive for a configured `log_level` (0-9)
pub fn level_directive(level: u8) -> String {
    let level = match level {
        0 | 1 => "info",
        2..=4 => "debug",
        _ => "trace",
    };
    format!("kubemcp={},kube=warn", level)
}

/// Lets a configuration reload change the log level
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    /// RUST_LOG was set; it wins over the configuration
    from_env: bool,
}

impl LogHandle {
    pub fn set_level(&self, level: u8) {
        if self.from_env {
            return;
        }
        if let Err(e) = self
            .filter
            .modify(|filter| *filter = EnvFilter::new(level_directive(level)))
        {
            tracing::warn!(error = %e, "Failed to update log level");
        }
    }
}

/// Initialize logging to stderr and, optionally, a rotated file under
/// ~/.kubemcp/log/
pub fn init_logging(level: u8, to_file: bool) -> LogHandle {
    use tracing_subscriber::fmt::format::FmtSpan;

    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(level_directive(level)), false),
    };
    let (filter_layer, filter) = reload::Layer::new(env_filter);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NONE);

    let file_layer = if to_file { file_writer() } else { None }.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::NONE)
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LogHandle { filter, from_env }
}

fn file_writer() -> Option<BoxMakeWriter> {
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};

    // Create log directory
    let log_dir = crate::config::base_dir()
        .map(|p| p.join("log"))
        .unwrap_or_else(|_| std::path::PathBuf::from("."));

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
        return None;
    }

    // File appender with size-based rotation:
    // - Max 10MB per file
    // - Keep up to 5 files (total max ~50MB)
    // - Also rotate daily
    let log_path = log_dir.join("kubemcp.log");
    let condition = RollingConditionBase::new()
        .daily()
        .max_size(10 * 1024 * 1024); // 10MB

    let file_appender = match RollingFileAppenderBase::new(log_path, condition, 5) {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Warning: Could not create log file: {}", e);
            return None;
        }
    };

    // Use non-blocking writer for better performance
    let (non_blocking, guard) = file_appender.get_non_blocking_appender();
    // Leak the guard to keep the background writer alive
    std::mem::forget(guard);
    Some(BoxMakeWriter::new(non_blocking))
}

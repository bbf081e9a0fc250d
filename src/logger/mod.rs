// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_logger() -> Result<()> {
    let level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "warn,warpplay=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| "Failed to parse log filter")?;
    let fmt_layer = fmt::layer().with_writer(std::io::stderr).compact();

    // the terminal is raw while playing, journald keeps the log readable
    let journald = std::env::var_os("JOURNAL_STREAM")
        .and_then(|_| tracing_journald::layer().ok());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(journald)
        .try_init()
        .with_context(|| "Failed to install logger")?;
    log_panics::init();

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    if cfg!(debug_assertions) {
        debug!(
            "Debug build ({})",
            std::option_env!("GIT_HASH").unwrap_or("Unknown")
        );
    }

    Ok(())
}

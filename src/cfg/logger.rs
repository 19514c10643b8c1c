// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// Level is controlled by `RUST_LOG` (default: `info`); output always goes
/// to stdout in the compact human-readable format. There is no structured
/// (JSON) sink and no file rotation here — this server has no external log
/// pipeline to feed, unlike the heavier initiator this crate grew out of.
pub fn init_logger() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to install global tracing subscriber")
}

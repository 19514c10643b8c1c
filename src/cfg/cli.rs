// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use clap::Parser;

/// Command-line arguments for the server binary.
///
/// Only two flags are exposed: the listening port and the maximum number of
/// concurrently connected clients. There is no configuration file and no
/// environment variable surface.
#[derive(Debug, Parser)]
#[command(name = "godis-server", about = "A single-threaded, in-memory key-value server")]
pub struct Cli {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 6666)]
    pub port: u16,

    /// Maximum number of concurrent clients.
    #[arg(long, default_value_t = 1000)]
    pub limit: usize,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["godis-server"]);
        assert_eq!(cli.port, 6666);
        assert_eq!(cli.limit, 1000);
    }

    #[test]
    fn overrides() {
        let cli = Cli::parse_from(["godis-server", "--port", "7000", "--limit", "10"]);
        assert_eq!(cli.port, 7000);
        assert_eq!(cli.limit, 10);
    }
}

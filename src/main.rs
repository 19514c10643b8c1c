// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use godis_rs::{
    cfg::{cli::Cli, logger::init_logger},
    server::Server,
};

fn main() -> Result<()> {
    init_logger()?;

    let cli = Cli::parse_args();
    let server = Server::new(cli.port, cli.limit)?;
    server.run()
}

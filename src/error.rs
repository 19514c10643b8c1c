// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Protocol-level error taxonomy.
//!
//! These are the errors a connection's incremental parser can raise. Every
//! one of them is fatal to the *connection* it occurred on (the caller
//! closes the socket) but never to the server.

use thiserror::Error;

/// Errors raised while parsing a client's request stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("too big inline request")]
    TooBigInline,
    #[error("too big bulk request")]
    TooBigBulk,
    #[error("expected '$' for bulk length")]
    ExpectedBulkLength,
    #[error("expected CRLF at end of bulk argument")]
    ExpectedBulkEnd,
}

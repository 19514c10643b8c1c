// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection incremental request parser and reply writer.
//!
//! `Connection` owns a growable query buffer plus a `cursor` marking how
//! much of it has been consumed — the idiomatic stand-in for the source's
//! `queryBuf = queryBuf[n:]` reslicing. The parser switches between the
//! inline and bulk-array dialects on the first unconsumed byte and survives
//! arbitrary TCP fragmentation: an incomplete request leaves `cmd_type`,
//! `bulk_num` and `bulk_len` exactly where parsing paused, so the next read
//! resumes rather than restarts.

pub mod reply;

use std::{
    io,
    net::TcpStream,
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
};

use reply::ReplyQueue;

use crate::{command, db::Database, error::ProtocolError, net, object::Obj};

/// Initial query buffer size.
const INITIAL_BUF: usize = 16 * 1024;
/// Growth increment once headroom drops below a single bulk payload.
const BUF_GROWTH: usize = 4 * 1024;
/// Cap on both an inline line and a single bulk payload.
const SIZE_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdType {
    Unknown,
    Inline,
    Bulk,
}

/// What the caller should do after a readiness callback returns.
pub struct ReadOutcome {
    pub close: bool,
    pub has_replies: bool,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

pub struct Connection {
    stream: TcpStream,
    fd: RawFd,
    buf: Vec<u8>,
    /// Bytes already parsed, not yet compacted out of `buf`.
    cursor: usize,
    /// Bytes filled by reads, including the already-consumed prefix.
    filled: usize,
    cmd_type: CmdType,
    bulk_num: usize,
    /// `None` until the current bulk's `$L` header has been parsed, so
    /// "no header yet" is distinguishable from "header said length 0" —
    /// an empty-length bulk `$0` is a valid zero-byte argument.
    bulk_len: Option<usize>,
    args: Vec<Rc<Obj>>,
    reply: ReplyQueue,
    sent_len: usize,
    should_close: bool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let fd = stream.as_raw_fd();
        Ok(Connection {
            stream,
            fd,
            buf: vec![0; INITIAL_BUF],
            cursor: 0,
            filled: 0,
            cmd_type: CmdType::Unknown,
            bulk_num: 0,
            bulk_len: None,
            args: Vec::new(),
            reply: ReplyQueue::new(),
            sent_len: 0,
            should_close: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn has_pending_replies(&self) -> bool {
        !self.reply.is_empty()
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.cursor..self.filled]
    }

    fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    /// Drops the already-consumed prefix so `buf` doesn't grow unbounded
    /// across many small requests on a long-lived connection.
    fn compact(&mut self) {
        if self.cursor > 0 {
            self.buf.drain(0..self.cursor);
            self.filled -= self.cursor;
            self.cursor = 0;
        }
    }

    fn ensure_capacity(&mut self) {
        if self.buf.len() - self.filled < SIZE_LIMIT {
            self.buf.resize(self.buf.len() + BUF_GROWTH, 0);
        }
    }

    fn reset_cmd(&mut self) {
        self.cmd_type = CmdType::Unknown;
        self.bulk_num = 0;
        self.bulk_len = None;
    }

    fn parse_inline(&mut self) -> Result<bool, ProtocolError> {
        let buf = self.remaining();
        let Some(pos) = find_crlf(buf) else {
            return if buf.len() > SIZE_LIMIT { Err(ProtocolError::TooBigInline) } else { Ok(false) };
        };
        self.args = buf[..pos]
            .split(|&b| b == b' ')
            .map(|tok| Obj::new_string(String::from_utf8_lossy(tok).into_owned()))
            .collect();
        self.advance(pos + 2);
        Ok(true)
    }

    fn parse_bulk(&mut self) -> Result<bool, ProtocolError> {
        if self.bulk_num == 0 {
            let buf = self.remaining();
            let Some(pos) = find_crlf(buf) else {
                return if buf.len() > SIZE_LIMIT { Err(ProtocolError::TooBigInline) } else { Ok(false) };
            };
            let line = &buf[..pos];
            let n: i64 = std::str::from_utf8(&line[1..])
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            self.advance(pos + 2);
            if n <= 0 {
                // Observable behavior: a zero-length array is a complete,
                // argument-less request.
                return Ok(true);
            }
            self.bulk_num = n as usize;
            self.args = Vec::with_capacity(self.bulk_num);
        }

        while self.bulk_num > 0 {
            if self.bulk_len.is_none() {
                let buf = self.remaining();
                let Some(pos) = find_crlf(buf) else {
                    return if buf.len() > SIZE_LIMIT { Err(ProtocolError::TooBigInline) } else { Ok(false) };
                };
                let line = &buf[..pos];
                if line.first() != Some(&b'$') {
                    return Err(ProtocolError::ExpectedBulkLength);
                }
                let len: i64 = std::str::from_utf8(&line[1..])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ProtocolError::ExpectedBulkLength)?;
                if len > SIZE_LIMIT as i64 {
                    return Err(ProtocolError::TooBigBulk);
                }
                self.advance(pos + 2);
                self.bulk_len = Some(len.max(0) as usize);
            }

            let bulk_len = self.bulk_len.expect("just set above");
            let buf = self.remaining();
            if buf.len() < bulk_len + 2 {
                return Ok(false);
            }
            if &buf[bulk_len..bulk_len + 2] != b"\r\n" {
                return Err(ProtocolError::ExpectedBulkEnd);
            }
            self.args
                .push(Obj::new_string(String::from_utf8_lossy(&buf[..bulk_len]).into_owned()));
            self.advance(bulk_len + 2);
            self.bulk_len = None;
            self.bulk_num -= 1;
        }
        Ok(true)
    }

    fn process_query(&mut self, db: &mut Database) -> Result<(), ProtocolError> {
        loop {
            if self.cmd_type == CmdType::Unknown {
                let Some(&first) = self.remaining().first() else {
                    break;
                };
                self.cmd_type = if first == b'*' { CmdType::Bulk } else { CmdType::Inline };
            }

            let complete = match self.cmd_type {
                CmdType::Inline => self.parse_inline()?,
                CmdType::Bulk => self.parse_bulk()?,
                CmdType::Unknown => unreachable!(),
            };
            if !complete {
                break;
            }

            if !self.args.is_empty() {
                let args = std::mem::take(&mut self.args);
                if args[0].as_str() == "quit" {
                    self.should_close = true;
                    return Ok(());
                }
                let reply = command::dispatch(&args, db);
                self.reply.push_back(reply);
            }

            self.reset_cmd();
            self.compact();
        }
        Ok(())
    }

    /// Called when the reactor reports the socket readable. Reads once,
    /// parses as many complete requests as the buffer now holds, and
    /// dispatches each.
    pub fn on_readable(&mut self, db: &mut Database) -> ReadOutcome {
        self.ensure_capacity();

        match net::read(&mut self.stream, &mut self.buf[self.filled..]) {
            Ok(0) => {
                return ReadOutcome { close: true, has_replies: self.has_pending_replies() };
            },
            Ok(n) => self.filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome { close: false, has_replies: false };
            },
            Err(e) => {
                tracing::warn!(fd = self.fd, error = %e, "read failed");
                return ReadOutcome { close: true, has_replies: self.has_pending_replies() };
            },
        }

        if let Err(e) = self.process_query(db) {
            tracing::debug!(fd = self.fd, error = %e, "protocol error, closing connection");
            return ReadOutcome { close: true, has_replies: self.has_pending_replies() };
        }

        ReadOutcome { close: self.should_close, has_replies: self.has_pending_replies() }
    }

    /// Called when the reactor reports the socket writable. Drains the
    /// reply queue front-to-back, tracking partial writes in `sent_len`.
    /// Returns `true` if the connection should be closed.
    pub fn on_writable(&mut self) -> bool {
        loop {
            let Some(front) = self.reply.front() else {
                return false;
            };
            let payload = front.as_bytes();
            if self.sent_len >= payload.len() {
                self.reply.pop_front();
                self.sent_len = 0;
                continue;
            }
            match net::write(&mut self.stream, &payload[self.sent_len..]) {
                Ok(n) => {
                    self.sent_len += n;
                    if self.sent_len < payload.len() {
                        return false;
                    }
                    self.reply.pop_front();
                    self.sent_len = 0;
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    tracing::warn!(fd = self.fd, error = %e, "send reply failed");
                    return true;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Connection, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect loopback client");
        let (server_side, _) = listener.accept().expect("accept loopback connection");
        server_side.set_nonblocking(true).expect("nonblocking");
        client.set_nonblocking(true).expect("nonblocking");
        (Connection::new(server_side).expect("wrap connection"), client)
    }

    #[test]
    fn inline_round_trip_produces_ordered_replies() {
        use std::io::Write;
        let (mut conn, mut client) = pair();
        let mut db = Database::new();

        client.write_all(b"set key val\r\n").expect("write to server");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let outcome = conn.on_readable(&mut db);
        assert!(!outcome.close);
        assert!(outcome.has_replies);
        assert_eq!(conn.reply.front().expect("reply queued").as_str(), "+OK\r\n");
        conn.on_writable();

        client.write_all(b"get key\r\n").expect("write to server");
        std::thread::sleep(std::time::Duration::from_millis(10));
        conn.on_readable(&mut db);
        assert_eq!(conn.reply.front().expect("reply queued").as_str(), "$3val\r\n");
    }

    #[test]
    fn fragmented_bulk_request_parses_once_complete() {
        use std::io::Write;
        let (mut conn, mut client) = pair();
        let mut db = Database::new();

        let whole = b"*3\r\n$3\r\nset\r\n$3\r\nkey\r\n$3\r\nval\r\n";
        let chunks: Vec<&[u8]> =
            vec![&whole[0..4], &whole[4..9], &whole[9..20], &whole[20..28], &whole[28..]];

        let mut saw_reply_early = false;
        for (i, chunk) in chunks.iter().enumerate() {
            client.write_all(chunk).expect("write to server");
            std::thread::sleep(std::time::Duration::from_millis(5));
            let outcome = conn.on_readable(&mut db);
            if i + 1 < chunks.len() {
                saw_reply_early |= outcome.has_replies;
            }
        }
        assert!(!saw_reply_early, "no reply before the request is complete");
        assert_eq!(conn.reply.front().expect("reply queued").as_str(), "+OK\r\n");
    }

    #[test]
    fn quit_closes_without_reply() {
        use std::io::Write;
        let (mut conn, mut client) = pair();
        let mut db = Database::new();
        client.write_all(b"quit\r\n").expect("write to server");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let outcome = conn.on_readable(&mut db);
        assert!(outcome.close);
        assert!(!outcome.has_replies);
    }

    #[test]
    fn empty_bulk_string_is_supported() {
        use std::io::Write;
        let (mut conn, mut client) = pair();
        let mut db = Database::new();
        client.write_all(b"*2\r\n$3\r\nget\r\n$0\r\n\r\n").expect("write to server");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let outcome = conn.on_readable(&mut db);
        assert!(outcome.has_replies);
        assert_eq!(conn.reply.front().expect("reply queued").as_str(), "-1\r\n");
    }

    #[test]
    fn unknown_command_and_arity_errors() {
        use std::io::Write;
        let (mut conn, mut client) = pair();
        let mut db = Database::new();

        client.write_all(b"foo\r\n").expect("write to server");
        std::thread::sleep(std::time::Duration::from_millis(10));
        conn.on_readable(&mut db);
        assert_eq!(conn.reply.front().expect("reply queued").as_str(), "-ERR: unknow command\r\n");
        conn.on_writable();

        client.write_all(b"set key\r\n").expect("write to server");
        std::thread::sleep(std::time::Duration::from_millis(10));
        conn.on_readable(&mut db);
        assert_eq!(conn.reply.front().expect("reply queued").as_str(), "-ERR: wrong number of args\r\n");
    }
}

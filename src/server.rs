// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Owns the database, the reactor, and the bounded client table; wires the
//! listening socket's accept handler and the active-expiration cron.

use std::{
    collections::HashMap,
    io,
    net::TcpListener,
    os::unix::io::{AsRawFd, RawFd},
};

use anyhow::{Context, Result};
use slab::Slab;

use crate::{
    conn::Connection,
    db::Database,
    net,
    reactor::{Direction, Reactor, TimerKind},
};

/// How often the active-expiration sweep runs.
const CRON_INTERVAL_MS: i64 = 100;

pub struct Server {
    db: Database,
    listener: TcpListener,
    clients: Slab<Connection>,
    fd_to_key: HashMap<RawFd, usize>,
    limit: usize,
}

impl Server {
    pub fn new(port: u16, limit: usize) -> Result<Self> {
        let listener = net::listen(port).with_context(|| format!("failed to listen on port {port}"))?;
        Ok(Server {
            db: Database::new(),
            listener,
            clients: Slab::new(),
            fd_to_key: HashMap::new(),
            limit,
        })
    }

    /// Runs the reactor loop until it is stopped. Never returns under normal
    /// operation — there is no external shutdown signal in this server's
    /// scope.
    pub fn run(mut self) -> Result<()> {
        let mut reactor: Reactor<Server> = Reactor::new().context("failed to create event loop")?;
        let listen_fd = self.listener.as_raw_fd();

        reactor.add_file_event(
            listen_fd,
            Direction::Read,
            Box::new(|r, fd, srv: &mut Server| srv.accept_handler(r, fd)),
        );
        reactor.add_time_event(
            TimerKind::Periodic,
            CRON_INTERVAL_MS,
            Box::new(|_r, _id, srv: &mut Server| srv.db.active_expire()),
        );

        tracing::info!(port = ?self.listener.local_addr().ok(), limit = self.limit, "server listening");
        reactor.run(&mut self).context("event loop failed")
    }

    fn accept_handler(&mut self, reactor: &mut Reactor<Server>, _listen_fd: RawFd) {
        let (stream, addr) = match net::accept(&self.listener) {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            },
        };

        if self.clients.len() >= self.limit {
            tracing::warn!(%addr, limit = self.limit, "exceeded max client limit, closing connection");
            // Closes the newly accepted fd; the listening socket stays open
            // and registered so it can keep accepting later connections.
            net::close(stream);
            return;
        }

        let conn = match Connection::new(stream) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to prepare connection");
                return;
            },
        };
        let fd = conn.fd();
        let key = self.clients.insert(conn);
        self.fd_to_key.insert(fd, key);

        tracing::debug!(%addr, fd, "accepted connection");
        reactor.add_file_event(
            fd,
            Direction::Read,
            Box::new(move |r, fd, srv: &mut Server| srv.read_handler(r, fd)),
        );
    }

    fn read_handler(&mut self, reactor: &mut Reactor<Server>, fd: RawFd) {
        let Some(&key) = self.fd_to_key.get(&fd) else {
            return;
        };
        let outcome = self.clients[key].on_readable(&mut self.db);

        if outcome.has_replies {
            reactor.add_file_event(
                fd,
                Direction::Write,
                Box::new(move |r, fd, srv: &mut Server| srv.write_handler(r, fd)),
            );
        }
        if outcome.close {
            self.free_client(reactor, fd);
        }
    }

    fn write_handler(&mut self, reactor: &mut Reactor<Server>, fd: RawFd) {
        let Some(&key) = self.fd_to_key.get(&fd) else {
            return;
        };
        let conn = &mut self.clients[key];
        let close = conn.on_writable();
        let drained = !conn.has_pending_replies();

        if close {
            self.free_client(reactor, fd);
            return;
        }
        if drained {
            reactor.remove_file_event(fd, Direction::Write);
        }
    }

    /// Unregisters both readiness directions and drops the connection,
    /// which closes its fd and releases its reply queue and in-flight
    /// argument `Rc`s — `Connection::drop` does what the source's
    /// `freeArgs`/`freeReplyList`/`Close` trio did by hand.
    fn free_client(&mut self, reactor: &mut Reactor<Server>, fd: RawFd) {
        reactor.remove_file_event(fd, Direction::Read);
        reactor.remove_file_event(fd, Direction::Write);
        if let Some(key) = self.fd_to_key.remove(&fd) {
            self.clients.remove(key);
        }
        tracing::debug!(fd, "connection closed");
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Thin wrappers over listen/accept/read/write/close.
//!
//! These are plain non-blocking `std::net` sockets; the reactor multiplexes
//! readiness on their raw file descriptors via `mio::unix::SourceFd`
//! (see `reactor`), so no socket here needs to be an `mio::net` type itself
//! — the kernel-level polling and the socket objects are kept decoupled,
//! same split as the source's `net.go` (raw syscalls) vs `event_loop.go`
//! (epoll).

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
};

use socket2::{Domain, Protocol, Socket, Type};

/// Listen backlog, matching the source's `Backlog` constant.
const BACKLOG: i32 = 64;

/// Creates an IPv4 listening socket bound to `port` with `SO_REUSEPORT` and
/// `SO_REUSEADDR` set, in non-blocking mode.
pub fn listen(port: u16) -> io::Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Accepts a single pending connection, returning the new non-blocking
/// stream and the peer address. Returns `WouldBlock` when nothing is
/// pending.
pub fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept()?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok((stream, addr))
}

/// Non-blocking read. `Ok(0)` means the peer has closed the connection.
pub fn read(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    stream.read(buf)
}

/// Non-blocking write.
pub fn write(stream: &mut TcpStream, buf: &[u8]) -> io::Result<usize> {
    stream.write(buf)
}

/// Closes a stream. `TcpStream`'s `Drop` impl already closes the
/// underlying fd; this exists to name the operation explicitly at call
/// sites, mirroring the source's `Close`.
pub fn close(stream: TcpStream) {
    drop(stream);
}

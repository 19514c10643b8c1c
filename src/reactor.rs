// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A hand-rolled, single-threaded, readiness-based event loop.
//!
//! Two registries live here: file events (readable/writable readiness on a
//! raw file descriptor) and time events (one-shot or periodic timers). Both
//! support idempotent registration and handlers that remove themselves or
//! other registrations mid-callback — the accept handler arms a read
//! handler on the new connection, a read handler may arm or disarm the
//! write handler on the same fd, and a write handler that drains its reply
//! queue removes itself.
//!
//! Sockets are plumbed in by raw fd via `mio::unix::SourceFd`, decoupling
//! polling from socket ownership (see `net`): the reactor never owns a
//! `TcpStream`, it only watches its fd.

use std::{
    collections::{HashMap, HashSet},
    io,
    os::unix::io::RawFd,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};

use crate::clock::now_ms;

/// Readiness direction a file event watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// Whether a timer fires once or keeps re-arming itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Once,
    Periodic,
}

pub type TimerId = u64;

type FileHandler<Ctx> = Box<dyn FnMut(&mut Reactor<Ctx>, RawFd, &mut Ctx)>;
type TimeHandler<Ctx> = Box<dyn FnMut(&mut Reactor<Ctx>, TimerId, &mut Ctx)>;

struct FileReg<Ctx> {
    fd: RawFd,
    direction: Direction,
    handler: FileHandler<Ctx>,
}

struct TimeReg<Ctx> {
    id: TimerId,
    kind: TimerKind,
    interval_ms: i64,
    when_ms: i64,
    handler: TimeHandler<Ctx>,
}

/// Upper bound on the poll timeout when no timers are registered, matching
/// the source's default wait.
const MAX_WAIT_MS: i64 = 1000;
/// Lower bound on the poll timeout, so a timer due "now" still gives the
/// kernel a moment to report readiness rather than spinning at zero.
const MIN_WAIT_MS: i64 = 10;

pub struct Reactor<Ctx> {
    poll: Poll,
    /// Current epoll interest per fd, used to decide register vs.
    /// reregister vs. deregister.
    interest: HashMap<RawFd, Interest>,
    /// The `(fd, direction)` pairs currently armed — the source of truth
    /// for whether a handler should be re-armed after it runs, independent
    /// of whether its slot happens to be empty mid-invocation.
    armed: HashSet<(RawFd, Direction)>,
    file_slots: Vec<Option<FileReg<Ctx>>>,
    alive_timers: HashSet<TimerId>,
    time_slots: Vec<Option<TimeReg<Ctx>>>,
    next_timer_id: TimerId,
    stop: bool,
}

impl<Ctx> Reactor<Ctx> {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            interest: HashMap::new(),
            armed: HashSet::new(),
            file_slots: Vec::new(),
            alive_timers: HashSet::new(),
            time_slots: Vec::new(),
            next_timer_id: 1,
            stop: false,
        })
    }

    /// Registers `handler` to run whenever `fd` becomes ready for
    /// `direction`. A no-op if that exact `(fd, direction)` pair is already
    /// armed.
    pub fn add_file_event(
        &mut self,
        fd: RawFd,
        direction: Direction,
        handler: FileHandler<Ctx>,
    ) {
        if self.armed.contains(&(fd, direction)) {
            return;
        }

        let existing = self.interest.get(&fd).copied();
        let merged = match existing {
            Some(i) => i | direction.interest(),
            None => direction.interest(),
        };

        let result = match existing {
            None => self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), merged),
            Some(_) => self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), merged),
        };

        if let Err(e) = result {
            tracing::warn!(fd, ?direction, error = %e, "failed to register file event");
            return;
        }

        self.interest.insert(fd, merged);
        self.armed.insert((fd, direction));

        let slot = Some(FileReg { fd, direction, handler });
        if let Some(free) = self.file_slots.iter_mut().find(|s| s.is_none()) {
            *free = slot;
        } else {
            self.file_slots.push(slot);
        }
    }

    /// Disarms `(fd, direction)`. Tolerates the pair not being armed —
    /// callers regularly remove events they are not sure were ever added.
    pub fn remove_file_event(&mut self, fd: RawFd, direction: Direction) {
        if !self.armed.remove(&(fd, direction)) {
            return;
        }

        let other = match direction {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        };
        let remaining = self.armed.contains(&(fd, other)).then(|| other.interest());

        let result = match remaining {
            Some(i) => self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), i),
            None => self.poll.registry().deregister(&mut SourceFd(&fd)),
        };
        if let Err(e) = result {
            tracing::warn!(fd, ?direction, error = %e, "failed to unregister file event");
        }

        match remaining {
            Some(i) => {
                self.interest.insert(fd, i);
            },
            None => {
                self.interest.remove(&fd);
            },
        }

        // Clear the stored slot if present. If a handler is removing its
        // own (fd, direction) mid-invocation the slot is already empty
        // here; `armed` no longer containing the pair is what stops it
        // from being reinserted in `run`.
        if let Some(slot) = self
            .file_slots
            .iter_mut()
            .find(|s| matches!(s, Some(r) if r.fd == fd && r.direction == direction))
        {
            *slot = None;
        }
    }

    /// Arms a new timer, returning its id (monotonically increasing,
    /// starting at 1).
    pub fn add_time_event(
        &mut self,
        kind: TimerKind,
        interval_ms: i64,
        handler: TimeHandler<Ctx>,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;

        let reg = TimeReg {
            id,
            kind,
            interval_ms,
            when_ms: now_ms() + interval_ms,
            handler,
        };
        self.alive_timers.insert(id);
        if let Some(free) = self.time_slots.iter_mut().find(|s| s.is_none()) {
            *free = Some(reg);
        } else {
            self.time_slots.push(Some(reg));
        }
        id
    }

    /// Disarms a timer. Tolerates an unknown or already-fired `id`.
    pub fn remove_time_event(&mut self, id: TimerId) {
        self.alive_timers.remove(&id);
        if let Some(slot) = self
            .time_slots
            .iter_mut()
            .find(|s| matches!(s, Some(t) if t.id == id))
        {
            *slot = None;
        }
    }

    /// Stops the loop after the current iteration.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    fn nearest_timer(&self, now: i64) -> i64 {
        self.time_slots
            .iter()
            .flatten()
            .map(|t| t.when_ms)
            .min()
            .unwrap_or(now + MAX_WAIT_MS)
    }

    fn fire_timer(&mut self, id: TimerId, ctx: &mut Ctx) {
        let Some(idx) = self.time_slots.iter().position(|s| matches!(s, Some(t) if t.id == id))
        else {
            return;
        };
        let Some(mut reg) = self.time_slots[idx].take() else {
            return;
        };

        (reg.handler)(self, id, ctx);

        if !self.alive_timers.contains(&id) {
            // The handler (or something it triggered) removed this timer.
            return;
        }
        match reg.kind {
            TimerKind::Once => {
                self.alive_timers.remove(&id);
            },
            TimerKind::Periodic => {
                reg.when_ms = now_ms() + reg.interval_ms;
                self.time_slots[idx] = Some(reg);
            },
        }
    }

    fn fire_file_event(&mut self, fd: RawFd, direction: Direction, ctx: &mut Ctx) {
        if !self.armed.contains(&(fd, direction)) {
            // Already disarmed earlier in this same poll batch.
            return;
        }
        let Some(idx) = self
            .file_slots
            .iter()
            .position(|s| matches!(s, Some(r) if r.fd == fd && r.direction == direction))
        else {
            return;
        };
        let Some(mut reg) = self.file_slots[idx].take() else {
            return;
        };

        (reg.handler)(self, fd, ctx);

        if self.armed.contains(&(fd, direction)) {
            self.file_slots[idx] = Some(reg);
        }
    }

    /// Runs the loop until `stop` is called.
    ///
    /// Each iteration: wait at most `max(nearest_timer - now, 10ms)`,
    /// capped at 1000ms when no timers are registered; then fire every due
    /// timer, in full, before dispatching any file event. This ordering is
    /// observable (a cron tick and a socket becoming readable in the same
    /// iteration always resolve timer-first) and is preserved deliberately.
    pub fn run(&mut self, ctx: &mut Ctx) -> io::Result<()> {
        let mut events = Events::with_capacity(256);

        while !self.stop {
            let now = now_ms();
            let nearest = self.nearest_timer(now);
            let wait_ms = (nearest - now).max(MIN_WAIT_MS);

            match self.poll.poll(&mut events, Some(Duration::from_millis(wait_ms as u64))) {
                Ok(()) => {},
                Err(e) => {
                    tracing::warn!(error = %e, "multiplexer poll failed, retrying next iteration");
                    continue;
                },
            }

            let mut fired: Vec<(RawFd, Direction)> = Vec::new();
            for ev in events.iter() {
                let fd = ev.token().0 as RawFd;
                if ev.is_readable() {
                    fired.push((fd, Direction::Read));
                }
                if ev.is_writable() {
                    fired.push((fd, Direction::Write));
                }
            }

            let now = now_ms();
            let due: Vec<TimerId> = self
                .time_slots
                .iter()
                .flatten()
                .filter(|t| t.when_ms <= now)
                .map(|t| t.id)
                .collect();

            for id in due {
                self.fire_timer(id, ctx);
            }
            for (fd, direction) in fired {
                self.fire_file_event(fd, direction, ctx);
            }
        }

        Ok(())
    }
}

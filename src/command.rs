// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command dispatch: name → handler table, arity check, reply formatting.

use std::rc::Rc;

use crate::{clock::now_ms, db::Database, object::{Obj, ObjType}};

const REPLY_WRONG_TYPE: &str = "-ERR: wrong type\r\n";
const REPLY_MINUS_ONE: &str = "-1\r\n";
const REPLY_OK: &str = "+OK\r\n";
const REPLY_UNKNOWN_CMD: &str = "-ERR: unknow command\r\n";
const REPLY_WRONG_NUMBER_OF_ARGS: &str = "-ERR: wrong number of args\r\n";

struct Command {
    name: &'static str,
    arity: usize,
    handler: fn(&[Rc<Obj>], &mut Database) -> String,
}

const TABLE: &[Command] = &[
    Command { name: "get", arity: 2, handler: get_cmd },
    Command { name: "set", arity: 3, handler: set_cmd },
    Command { name: "expire", arity: 3, handler: expire_cmd },
];

fn lookup(name: &str) -> Option<&'static Command> {
    TABLE.iter().find(|c| c.name == name)
}

/// Looks up `args[0]` in the dispatch table, checks arity, and runs the
/// handler. `args` must be non-empty — callers only reach dispatch once a
/// full request has parsed.
pub fn dispatch(args: &[Rc<Obj>], db: &mut Database) -> Rc<Obj> {
    let name = args[0].as_str();
    tracing::debug!(cmd = name, "process command");

    let reply = match lookup(name) {
        None => REPLY_UNKNOWN_CMD.to_string(),
        Some(cmd) if cmd.arity != args.len() => REPLY_WRONG_NUMBER_OF_ARGS.to_string(),
        Some(cmd) => (cmd.handler)(args, db),
    };
    Obj::new_string(reply)
}

fn get_cmd(args: &[Rc<Obj>], db: &mut Database) -> String {
    let key = &args[1];
    match db.lookup(key) {
        None => REPLY_MINUS_ONE.to_string(),
        Some(val) if val.kind != ObjType::String => REPLY_WRONG_TYPE.to_string(),
        Some(val) => format!("${}{}\r\n", val.len(), val.as_str()),
    }
}

fn set_cmd(args: &[Rc<Obj>], db: &mut Database) -> String {
    let (key, val) = (&args[1], &args[2]);
    if val.kind != ObjType::String {
        return REPLY_WRONG_TYPE.to_string();
    }
    db.set(Rc::clone(key), Rc::clone(val));
    REPLY_OK.to_string()
}

fn expire_cmd(args: &[Rc<Obj>], db: &mut Database) -> String {
    let (key, val) = (&args[1], &args[2]);
    if val.kind != ObjType::String {
        return REPLY_WRONG_TYPE.to_string();
    }
    let when_ms = now_ms() + val.as_int() * 1000;
    db.expire(Rc::clone(key), Obj::new_int(when_ms));
    REPLY_OK.to_string()
}

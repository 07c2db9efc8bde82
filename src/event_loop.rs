/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Single-threaded cooperative event loop.
//!
//! Rules come in two kinds: readable rules bound to a file descriptor, and
//! background rules gated by an interest predicate (timers, deadlines). Each
//! `wait_next_event` pass dispatches at most one ready rule. Rules run over a
//! caller-owned context rather than holding back-pointers, so there are no
//! ownership cycles between the loop and the components it drives.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Result, StagecastError};

/// What a rule callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Keep the rule installed.
    Continue,
    /// Remove the rule.
    Cancel,
    /// Stop the whole loop.
    Exit,
}

/// What one `wait_next_event` pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopResult {
    Dispatched,
    Timeout,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleId(u64);

type Callback<Ctx> = Box<dyn FnMut(&mut Ctx) -> Result<RuleOutcome>>;
type Interest<Ctx> = Box<dyn Fn(&Ctx) -> bool>;
type Recovery<Ctx> = Box<dyn FnMut(&mut Ctx) -> RuleOutcome>;

enum RuleKind<Ctx> {
    Readable { fd: RawFd },
    Background { interest: Interest<Ctx> },
}

struct Rule<Ctx> {
    id: RuleId,
    name: &'static str,
    kind: RuleKind<Ctx>,
    callback: Callback<Ctx>,
    recovery: Option<Recovery<Ctx>>,
    cancelled: bool,
}

pub struct EventLoop<Ctx> {
    rules: Vec<Rule<Ctx>>,
    next_id: u64,
}

impl<Ctx> Default for EventLoop<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> EventLoop<Ctx> {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> RuleId {
        let id = RuleId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Install a rule fired when `fd` becomes readable. The recovery callback
    /// runs instead of failing the loop when the rule hits an I/O error.
    pub fn add_readable_rule(
        &mut self,
        name: &'static str,
        fd: RawFd,
        callback: Callback<Ctx>,
        recovery: Option<Recovery<Ctx>>,
    ) -> RuleId {
        let id = self.allocate_id();
        self.rules.push(Rule {
            id,
            name,
            kind: RuleKind::Readable { fd },
            callback,
            recovery,
            cancelled: false,
        });
        id
    }

    /// Install a rule fired whenever its interest predicate is true.
    pub fn add_background_rule(
        &mut self,
        name: &'static str,
        interest: Interest<Ctx>,
        callback: Callback<Ctx>,
    ) -> RuleId {
        let id = self.allocate_id();
        self.rules.push(Rule {
            id,
            name,
            kind: RuleKind::Background { interest },
            callback,
            recovery: None,
            cancelled: false,
        });
        id
    }

    /// Cooperative cancellation; takes effect before the next dispatch.
    pub fn cancel(&mut self, id: RuleId) {
        if let Some(rule) = self.rules.iter_mut().find(|rule| rule.id == id) {
            rule.cancelled = true;
        }
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Poll for readiness and dispatch at most one ready rule.
    pub fn wait_next_event(&mut self, ctx: &mut Ctx, timeout: Duration) -> Result<LoopResult> {
        self.rules.retain(|rule| !rule.cancelled);

        // Background rules are checked first; they carry the deadlines.
        for index in 0..self.rules.len() {
            let ready = match &self.rules[index].kind {
                RuleKind::Background { interest } => interest(ctx),
                RuleKind::Readable { .. } => false,
            };
            if ready {
                return self.dispatch(index, ctx);
            }
        }

        let mut pollfds: Vec<(usize, libc::pollfd)> = self
            .rules
            .iter()
            .enumerate()
            .filter_map(|(index, rule)| match rule.kind {
                RuleKind::Readable { fd } => Some((
                    index,
                    libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    },
                )),
                RuleKind::Background { .. } => None,
            })
            .collect();

        if pollfds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(LoopResult::Timeout);
        }

        let mut fds: Vec<libc::pollfd> = pollfds.iter().map(|(_, pollfd)| *pollfd).collect();
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(LoopResult::Timeout);
            }
            return Err(err.into());
        }
        if ready == 0 {
            return Ok(LoopResult::Timeout);
        }

        for (slot, fd) in fds.iter().enumerate() {
            if fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                let index = pollfds.remove(slot).0;
                return self.dispatch(index, ctx);
            }
        }
        Ok(LoopResult::Timeout)
    }

    fn dispatch(&mut self, index: usize, ctx: &mut Ctx) -> Result<LoopResult> {
        let rule = &mut self.rules[index];
        match (rule.callback)(ctx) {
            Ok(RuleOutcome::Continue) => Ok(LoopResult::Dispatched),
            Ok(RuleOutcome::Cancel) => {
                rule.cancelled = true;
                Ok(LoopResult::Dispatched)
            }
            Ok(RuleOutcome::Exit) => Ok(LoopResult::Exit),
            Err(StagecastError::Io(e)) => match rule.recovery.as_mut() {
                Some(recovery) => {
                    log::warn!("rule '{}' failed ({e}), running recovery", rule.name);
                    match recovery(ctx) {
                        RuleOutcome::Continue => Ok(LoopResult::Dispatched),
                        RuleOutcome::Cancel => {
                            rule.cancelled = true;
                            Ok(LoopResult::Dispatched)
                        }
                        RuleOutcome::Exit => Ok(LoopResult::Exit),
                    }
                }
                None => Err(StagecastError::Io(e)),
            },
            Err(e) => Err(e),
        }
    }
}

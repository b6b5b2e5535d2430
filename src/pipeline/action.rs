//! Actions and their explicit resume state machine.

use bitflags::bitflags;

use crate::{
    error::Limit,
    func::Funcdata,
    rules::{BreakFlags, PoolOutcome, RulePool},
    Error, Result,
};

/// The body of a leaf action.
pub type LeafBody = fn(&mut Funcdata) -> Result<bool>;

bitflags! {
    /// Behavior properties governing an action.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ActionFlags: u8 {
        /// Re-run the whole body until no sub-action reports a change.
        const REPEAT_APPLY = 1 << 0;
        /// Apply at most once per function.
        const ONCE_PER_FUNC = 1 << 1;
        /// Report a change at most once per function.
        const ONE_ACT_PER_FUNC = 1 << 2;
        /// Issue a warning when the action makes a change.
        const WARNINGS_ON = 1 << 3;
        /// The warning has been issued.
        const WARNINGS_GIVEN = 1 << 4;
    }
}

/// Where an action is in its lifecycle.
///
/// Transitions are pure functions of the current status and the last apply
/// result; resuming after a breakpoint is a plain call, not a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// Never applied (or reset) for the current function.
    Start,
    /// A break-on-entry fired; the next apply proceeds past it.
    BreakStartHit,
    /// Re-running because the repeat property demanded another round.
    Repeat,
    /// Mid-application; a sub-action holds the resume position.
    Mid,
    /// Completed for this function.
    End,
    /// A break-on-change fired after completion of a sub-step.
    ActionBreak,
}

/// Result of one application attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The action ran to completion.
    Complete {
        /// `true` if anything changed.
        changed: bool,
    },
    /// A breakpoint fired; apply again to resume at the next step.
    Break,
}

/// The flavor-specific payload of an action.
#[derive(Clone)]
pub enum ActionBody {
    /// A single transformation.
    Leaf(LeafBody),
    /// A pool of rewrite rules applied to fixed point.
    Pool(RulePool),
    /// An ordered list of sub-actions.
    Group(Vec<Action>),
    /// A group that honors restart requests, up to a limit.
    RestartGroup {
        /// Sub-actions of the group.
        list: Vec<Action>,
        /// Maximum restarts before failing.
        max_restarts: usize,
        /// Restarts consumed for the current function.
        restarts: usize,
    },
}

/// A named, grouped unit of work on a function.
#[derive(Clone)]
pub struct Action {
    name: &'static str,
    group: &'static str,
    flags: ActionFlags,
    breakpoint: BreakFlags,
    status: ActionStatus,
    /// Resume index into a group body.
    state: usize,
    /// `true` once a change was reported for this function.
    acted: bool,
    count_tests: u32,
    count_apply: u32,
    body: ActionBody,
}

impl Action {
    /// Creates an action.
    #[must_use]
    pub fn new(name: &'static str, group: &'static str, flags: ActionFlags, body: ActionBody) -> Self {
        Self {
            name,
            group,
            flags,
            breakpoint: BreakFlags::empty(),
            status: ActionStatus::Start,
            state: 0,
            acted: false,
            count_tests: 0,
            count_apply: 0,
            body,
        }
    }

    /// Returns the action's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the action's group.
    #[must_use]
    pub const fn group(&self) -> &'static str {
        self.group
    }

    /// Returns the current lifecycle status.
    #[must_use]
    pub const fn status(&self) -> ActionStatus {
        self.status
    }

    /// Returns how many times apply was attempted.
    #[must_use]
    pub const fn num_tests(&self) -> u32 {
        self.count_tests
    }

    /// Returns how many times apply reported a change.
    #[must_use]
    pub const fn num_apply(&self) -> u32 {
        self.count_apply
    }

    /// Returns the body payload.
    #[must_use]
    pub const fn body(&self) -> &ActionBody {
        &self.body
    }

    /// Sets breakpoint toggles on this action.
    pub fn set_break(&mut self, flags: BreakFlags) {
        self.breakpoint |= flags;
    }

    /// Clears breakpoint toggles.
    pub fn clear_break(&mut self, flags: BreakFlags) {
        self.breakpoint &= !flags;
    }

    /// Sets a breakpoint on a named sub-action, returning `true` if found.
    pub fn set_break_on(&mut self, name: &str, flags: BreakFlags) -> bool {
        if self.name == name {
            self.set_break(flags);
            return true;
        }
        match &mut self.body {
            ActionBody::Group(list) | ActionBody::RestartGroup { list, .. } => {
                list.iter_mut().any(|a| a.set_break_on(name, flags))
            }
            ActionBody::Pool(pool) => pool
                .rule_mut(name)
                .map(|r| r.set_break(flags))
                .is_some(),
            ActionBody::Leaf(_) => false,
        }
    }

    /// Finds a sub-action by name.
    #[must_use]
    pub fn sub_action(&self, name: &str) -> Option<&Action> {
        if self.name == name {
            return Some(self);
        }
        match &self.body {
            ActionBody::Group(list) | ActionBody::RestartGroup { list, .. } => {
                list.iter().find_map(|a| a.sub_action(name))
            }
            _ => None,
        }
    }

    /// Resets the action (and its sub-actions) to initial status for a new
    /// function or a restart.
    pub fn reset(&mut self) {
        self.status = ActionStatus::Start;
        self.state = 0;
        self.acted = false;
        match &mut self.body {
            ActionBody::Group(list) => {
                for a in list {
                    a.reset();
                }
            }
            ActionBody::RestartGroup { list, restarts, .. } => {
                *restarts = 0;
                for a in list {
                    a.reset();
                }
            }
            ActionBody::Pool(pool) => pool.reset(),
            ActionBody::Leaf(_) => {}
        }
    }

    /// Resets only the statistics counters, recursively.
    pub fn reset_stats(&mut self) {
        self.count_tests = 0;
        self.count_apply = 0;
        match &mut self.body {
            ActionBody::Group(list) | ActionBody::RestartGroup { list, .. } => {
                for a in list {
                    a.reset_stats();
                }
            }
            ActionBody::Pool(pool) => pool.reset_stats(),
            ActionBody::Leaf(_) => {}
        }
    }

    /// Clones this action if its group (or any sub-action's group) is in
    /// the keep list; groups are filtered recursively.
    #[must_use]
    pub fn clone_filtered(&self, keep: &[String]) -> Option<Action> {
        let kept_body = match &self.body {
            ActionBody::Leaf(f) => {
                if !keep.iter().any(|g| g == self.group) {
                    return None;
                }
                ActionBody::Leaf(*f)
            }
            ActionBody::Pool(pool) => {
                let mut filtered = pool.clone();
                let keep_refs: Vec<&str> = keep.iter().map(String::as_str).collect();
                filtered.retain_groups(&keep_refs);
                if filtered.rules().is_empty() {
                    return None;
                }
                filtered.reset();
                ActionBody::Pool(filtered)
            }
            ActionBody::Group(list) => {
                let kept: Vec<Action> =
                    list.iter().filter_map(|a| a.clone_filtered(keep)).collect();
                if kept.is_empty() {
                    return None;
                }
                ActionBody::Group(kept)
            }
            ActionBody::RestartGroup {
                list,
                max_restarts,
                ..
            } => {
                let kept: Vec<Action> =
                    list.iter().filter_map(|a| a.clone_filtered(keep)).collect();
                if kept.is_empty() {
                    return None;
                }
                ActionBody::RestartGroup {
                    list: kept,
                    max_restarts: *max_restarts,
                    restarts: 0,
                }
            }
        };
        let mut clone = Action::new(self.name, self.group, self.flags, kept_body);
        clone.breakpoint = self.breakpoint;
        Some(clone)
    }

    /// Makes a single attempt to apply this action.
    ///
    /// Returns [`ApplyOutcome::Break`] when a breakpoint fires; calling
    /// again resumes at the next step without re-running completed ones.
    ///
    /// # Errors
    ///
    /// Propagates fatal failures; a restart group that exhausts its budget
    /// fails with [`Error::RestartExhausted`].
    pub fn apply(&mut self, fd: &mut Funcdata) -> Result<ApplyOutcome> {
        match self.status {
            ActionStatus::Start | ActionStatus::Repeat => {
                if self
                    .breakpoint
                    .intersects(BreakFlags::BREAK_START | BreakFlags::TMPBREAK_START)
                    && self.status == ActionStatus::Start
                {
                    self.breakpoint &= !BreakFlags::TMPBREAK_START;
                    self.status = ActionStatus::BreakStartHit;
                    return Ok(ApplyOutcome::Break);
                }
            }
            ActionStatus::BreakStartHit | ActionStatus::Mid | ActionStatus::ActionBreak => {}
            ActionStatus::End => {
                if self.flags.contains(ActionFlags::ONCE_PER_FUNC) {
                    return Ok(ApplyOutcome::Complete { changed: false });
                }
            }
        }
        if self.flags.contains(ActionFlags::ONE_ACT_PER_FUNC) && self.acted {
            self.status = ActionStatus::End;
            return Ok(ApplyOutcome::Complete { changed: false });
        }
        self.status = ActionStatus::Mid;
        self.count_tests += 1;

        let outcome = self.apply_body(fd)?;
        match outcome {
            ApplyOutcome::Complete { changed } => {
                if changed {
                    self.count_apply += 1;
                    self.acted = true;
                    if self.flags.contains(ActionFlags::WARNINGS_ON)
                        && !self.flags.contains(ActionFlags::WARNINGS_GIVEN)
                    {
                        self.flags |= ActionFlags::WARNINGS_GIVEN;
                        fd.warning_header(&format!("Action {} applied", self.name));
                    }
                    if self
                        .breakpoint
                        .intersects(BreakFlags::BREAK_ACTION | BreakFlags::TMPBREAK_ACTION)
                    {
                        self.breakpoint &= !BreakFlags::TMPBREAK_ACTION;
                        self.status = ActionStatus::ActionBreak;
                        return Ok(ApplyOutcome::Break);
                    }
                }
                self.status = ActionStatus::End;
                Ok(ApplyOutcome::Complete { changed })
            }
            ApplyOutcome::Break => Ok(ApplyOutcome::Break),
        }
    }

    /// Applies the body, honoring repeat and restart semantics.
    fn apply_body(&mut self, fd: &mut Funcdata) -> Result<ApplyOutcome> {
        let repeat = self.flags.contains(ActionFlags::REPEAT_APPLY);
        let max_rounds = fd.limits().max_group_iterations;
        match &mut self.body {
            ActionBody::Leaf(f) => {
                let mut changed = false;
                loop {
                    let round = f(fd)?;
                    changed |= round;
                    if !round || !repeat {
                        break;
                    }
                }
                Ok(ApplyOutcome::Complete { changed })
            }
            ActionBody::Pool(pool) => match pool.apply(fd)? {
                PoolOutcome::Complete(changed) => Ok(ApplyOutcome::Complete { changed }),
                PoolOutcome::Break => Ok(ApplyOutcome::Break),
            },
            ActionBody::Group(_) => self.apply_group(fd, repeat, max_rounds, false),
            ActionBody::RestartGroup { .. } => self.apply_group(fd, repeat, max_rounds, true),
        }
    }

    /// Runs the sub-action list, resuming at `state`, optionally looping
    /// to a fixed point and honoring restart requests.
    fn apply_group(
        &mut self,
        fd: &mut Funcdata,
        repeat: bool,
        max_rounds: usize,
        restartable: bool,
    ) -> Result<ApplyOutcome> {
        let mut any_change = false;
        let mut rounds = 0usize;
        loop {
            let mut round_change = false;
            let len = match &self.body {
                ActionBody::Group(list) | ActionBody::RestartGroup { list, .. } => list.len(),
                _ => unreachable!("apply_group on non-group"),
            };
            while self.state < len {
                let idx = self.state;
                let sub = match &mut self.body {
                    ActionBody::Group(list) | ActionBody::RestartGroup { list, .. } => {
                        &mut list[idx]
                    }
                    _ => unreachable!("apply_group on non-group"),
                };
                match sub.apply(fd)? {
                    ApplyOutcome::Complete { changed } => {
                        round_change |= changed;
                        self.state += 1;
                    }
                    ApplyOutcome::Break => return Ok(ApplyOutcome::Break),
                }
            }
            self.state = 0;
            any_change |= round_change;

            // A pending restart re-initializes the whole group
            if restartable && fd.restart_pending() {
                fd.set_restart_pending(false);
                let (exhausted, max) = match &mut self.body {
                    ActionBody::RestartGroup {
                        max_restarts,
                        restarts,
                        ..
                    } => {
                        *restarts += 1;
                        (*restarts > *max_restarts, *max_restarts)
                    }
                    _ => unreachable!("restart outside restart group"),
                };
                if exhausted {
                    return Err(Error::RestartExhausted(max));
                }
                match &mut self.body {
                    ActionBody::RestartGroup { list, .. } => {
                        for a in list {
                            a.reset();
                        }
                    }
                    _ => unreachable!("restart outside restart group"),
                }
                any_change = true;
                continue;
            }

            if !repeat || !round_change {
                break;
            }
            // Sub-actions must rewind for the next round
            let list = match &mut self.body {
                ActionBody::Group(list) | ActionBody::RestartGroup { list, .. } => list,
                _ => unreachable!("apply_group on non-group"),
            };
            for a in list {
                if !a.flags.contains(ActionFlags::ONCE_PER_FUNC) {
                    a.status = ActionStatus::Repeat;
                }
            }
            rounds += 1;
            if rounds >= max_rounds {
                return Err(Error::LimitExceeded {
                    limit: Limit::PipelineIterations,
                    value: max_rounds,
                });
            }
        }
        Ok(ApplyOutcome::Complete { changed: any_change })
    }

    /// Repeatedly applies until completion, driving through breakpoints.
    ///
    /// Interactive hosts call [`Action::apply`] directly to observe each
    /// break; this entry is for batch analysis.
    ///
    /// # Errors
    ///
    /// Propagates apply failures.
    pub fn perform(&mut self, fd: &mut Funcdata) -> Result<bool> {
        loop {
            match self.apply(fd)? {
                ApplyOutcome::Complete { changed } => return Ok(changed),
                ApplyOutcome::Break => {}
            }
        }
    }

    /// Writes statistics for this action tree into `out`.
    pub fn print_statistics(&self, out: &mut String) {
        use std::fmt::Write;
        if self.count_tests > 0 {
            let _ = writeln!(
                out,
                "{}: tests={} apply={}",
                self.name, self.count_tests, self.count_apply
            );
        }
        match &self.body {
            ActionBody::Group(list) | ActionBody::RestartGroup { list, .. } => {
                for a in list {
                    a.print_statistics(out);
                }
            }
            ActionBody::Pool(pool) => pool.print_statistics(out),
            ActionBody::Leaf(_) => {}
        }
    }
}

//! Local rewrite rules and the pool that applies them.
//!
//! A [`Rule`] is a named, grouped, stateless rewrite keyed by an opcode
//! filter. A [`RulePool`] indexes rules per opcode and sweeps every alive
//! operation in creation order, retrying until a full sweep makes no
//! change. Sweeps are bounded; an oscillating rule set stops the pipeline
//! instead of hanging it.
//!
//! Rules must preserve semantics bit-exactly (arithmetic) or truth-exactly
//! (comparisons), must not delete the triggering op without reporting a
//! change, and may rely on known-zero masks only as last computed.

mod arithmetic;
mod comparison;
mod copyprop;
mod eval;

pub use eval::{fold_binary, fold_unary};

use bitflags::bitflags;
use strum::EnumCount;

use crate::{func::Funcdata, ir::OpId, opcodes::OpCode, Error, Result};

/// The body of a rule: attempt a rewrite rooted at one operation.
pub type RuleBody = fn(&mut Funcdata, OpId) -> Result<bool>;

bitflags! {
    /// Behavior properties of a rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuleFlags: u8 {
        /// The rule is disabled within its pool.
        const DISABLED = 1 << 0;
        /// Issue a warning the first time the rule applies.
        const WARNINGS_ON = 1 << 1;
        /// The warning has already been issued.
        const WARNINGS_GIVEN = 1 << 2;
    }
}

bitflags! {
    /// Breakpoint toggles shared by rules and actions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BreakFlags: u8 {
        /// Persistent break before applying.
        const BREAK_START = 1 << 0;
        /// One-shot break before applying.
        const TMPBREAK_START = 1 << 1;
        /// Persistent break after a change.
        const BREAK_ACTION = 1 << 2;
        /// One-shot break after a change.
        const TMPBREAK_ACTION = 1 << 3;
    }
}

/// Outcome of one rule attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOutcome {
    NoChange,
    Changed,
    /// Changed, and a break-on-change fired.
    ChangedBreak,
    /// A break-on-entry fired before the attempt.
    EntryBreak,
}

/// A single local transformation on an operation.
#[derive(Clone)]
pub struct Rule {
    name: &'static str,
    group: &'static str,
    oplist: Vec<OpCode>,
    flags: RuleFlags,
    breakpoint: BreakFlags,
    count_tests: u32,
    count_apply: u32,
    body: RuleBody,
}

impl Rule {
    /// Creates a rule. An empty `oplist` triggers on every opcode.
    #[must_use]
    pub fn new(name: &'static str, group: &'static str, oplist: Vec<OpCode>, body: RuleBody) -> Self {
        Self {
            name,
            group,
            oplist,
            flags: RuleFlags::empty(),
            breakpoint: BreakFlags::empty(),
            count_tests: 0,
            count_apply: 0,
            body,
        }
    }

    /// Returns the rule's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the rule's group.
    #[must_use]
    pub const fn group(&self) -> &'static str {
        self.group
    }

    /// Returns how many times the rule was attempted.
    #[must_use]
    pub const fn num_tests(&self) -> u32 {
        self.count_tests
    }

    /// Returns how many times the rule applied successfully.
    #[must_use]
    pub const fn num_apply(&self) -> u32 {
        self.count_apply
    }

    /// Sets breakpoint toggles.
    pub fn set_break(&mut self, flags: BreakFlags) {
        self.breakpoint |= flags;
    }

    /// Clears breakpoint toggles.
    pub fn clear_break(&mut self, flags: BreakFlags) {
        self.breakpoint &= !flags;
    }

    /// Disables the rule within its pool.
    pub fn set_disabled(&mut self, disabled: bool) {
        if disabled {
            self.flags |= RuleFlags::DISABLED;
        } else {
            self.flags &= !RuleFlags::DISABLED;
        }
    }

    /// Returns `true` if the rule is disabled.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.flags.contains(RuleFlags::DISABLED)
    }

    /// Resets the statistics counters.
    pub fn reset_stats(&mut self) {
        self.count_tests = 0;
        self.count_apply = 0;
    }

    fn attempt(&mut self, fd: &mut Funcdata, op: OpId, skip_entry_break: bool) -> Result<RuleOutcome> {
        if !skip_entry_break
            && self
                .breakpoint
                .intersects(BreakFlags::BREAK_START | BreakFlags::TMPBREAK_START)
        {
            self.breakpoint &= !BreakFlags::TMPBREAK_START;
            return Ok(RuleOutcome::EntryBreak);
        }
        self.count_tests += 1;
        if !(self.body)(fd, op)? {
            return Ok(RuleOutcome::NoChange);
        }
        self.count_apply += 1;
        if self.flags.contains(RuleFlags::WARNINGS_ON)
            && !self.flags.contains(RuleFlags::WARNINGS_GIVEN)
        {
            self.flags |= RuleFlags::WARNINGS_GIVEN;
            fd.warning_header(&format!("Rule {} applied", self.name));
        }
        if self
            .breakpoint
            .intersects(BreakFlags::BREAK_ACTION | BreakFlags::TMPBREAK_ACTION)
        {
            self.breakpoint &= !BreakFlags::TMPBREAK_ACTION;
            return Ok(RuleOutcome::ChangedBreak);
        }
        Ok(RuleOutcome::Changed)
    }
}

/// Where a paused pool resumes. A `rule_index` of `usize::MAX` means the
/// break fired after a change and the sweep continues at the next op.
#[derive(Debug, Clone, Copy)]
struct PoolResume {
    cursor: Option<u32>,
    rule_index: usize,
    sweep: usize,
    sweep_changed: bool,
    any_change: bool,
}

/// Result of applying a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOutcome {
    /// The pool reached a fixed point; `true` if any rule ever applied.
    Complete(bool),
    /// A breakpoint fired; reapply to resume past it.
    Break,
}

/// A set of rules applied together to fixed point.
#[derive(Clone)]
pub struct RulePool {
    rules: Vec<Rule>,
    /// Rule indices per opcode, in registration order. Built once by
    /// [`RulePool::build_index`].
    per_opcode: Vec<Vec<usize>>,
    indexed: bool,
    resume: Option<PoolResume>,
}

impl RulePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            per_opcode: (0..OpCode::COUNT).map(|_| Vec::new()).collect(),
            indexed: false,
            resume: None,
        }
    }

    /// Adds a rule. The index is rebuilt on the next application.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.indexed = false;
    }

    /// Returns the rules of this pool.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Finds a rule by name.
    pub fn rule_mut(&mut self, name: &str) -> Option<&mut Rule> {
        self.rules.iter_mut().find(|r| r.name() == name)
    }

    /// Keeps only rules whose group is in `groups`.
    pub fn retain_groups(&mut self, groups: &[&str]) {
        self.rules.retain(|r| groups.contains(&r.group()));
        self.indexed = false;
    }

    fn build_index(&mut self) {
        for bucket in &mut self.per_opcode {
            bucket.clear();
        }
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.oplist.is_empty() {
                for bucket in &mut self.per_opcode {
                    bucket.push(idx);
                }
            } else {
                for &opc in &rule.oplist {
                    self.per_opcode[opc.index()].push(idx);
                }
            }
        }
        self.indexed = true;
    }

    /// Resets transient pool state for a new function.
    pub fn reset(&mut self) {
        self.resume = None;
    }

    /// Resets statistics of every rule.
    pub fn reset_stats(&mut self) {
        for rule in &mut self.rules {
            rule.reset_stats();
        }
    }

    /// Applies every matching rule to every alive op, in creation order,
    /// repeating until a full sweep changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuleNontermination`] when the sweep cap is hit.
    pub fn apply(&mut self, fd: &mut Funcdata) -> Result<PoolOutcome> {
        if !self.indexed {
            self.build_index();
        }
        let max_sweeps = fd.limits().max_rule_sweeps;

        let (mut cursor, mut revisit_rule, mut sweep, mut sweep_changed, mut any_change) =
            match self.resume.take() {
                Some(r) => {
                    let revisit = (r.rule_index != usize::MAX).then_some(r.rule_index);
                    (r.cursor, revisit, r.sweep, r.sweep_changed, r.any_change)
                }
                None => (None, None, 0, false, false),
            };

        loop {
            // Sweep alive ops in creation order; the cursor survives
            // arbitrary mutation by rule bodies
            loop {
                let current = if revisit_rule.is_some() {
                    // A paused entry break lands back on the same op
                    match cursor.and_then(|c| fd.store.alive_op_at(c).map(|id| (c, id))) {
                        Some(pair) => Some(pair),
                        None => {
                            revisit_rule = None;
                            fd.store.next_alive_after(cursor)
                        }
                    }
                } else {
                    fd.store.next_alive_after(cursor)
                };
                let Some((key, op)) = current else { break };
                cursor = Some(key);
                let start_rule = revisit_rule.take();

                let opcode = fd.store.op(op).opcode();
                let indices = self.per_opcode[opcode.index()].clone();
                for &ridx in &indices {
                    if let Some(start) = start_rule {
                        if ridx < start {
                            continue;
                        }
                    }
                    if self.rules[ridx].is_disabled() {
                        continue;
                    }
                    if !fd.store.op_exists(op)
                        || !fd.store.op(op).is_alive()
                        || fd.store.op(op).opcode() != opcode
                    {
                        break;
                    }
                    let skip_entry = start_rule == Some(ridx);
                    match self.rules[ridx].attempt(fd, op, skip_entry)? {
                        RuleOutcome::NoChange => {}
                        RuleOutcome::Changed => {
                            sweep_changed = true;
                            any_change = true;
                            break;
                        }
                        RuleOutcome::ChangedBreak => {
                            self.resume = Some(PoolResume {
                                cursor,
                                rule_index: usize::MAX,
                                sweep,
                                sweep_changed: true,
                                any_change: true,
                            });
                            return Ok(PoolOutcome::Break);
                        }
                        RuleOutcome::EntryBreak => {
                            self.resume = Some(PoolResume {
                                cursor,
                                rule_index: ridx,
                                sweep,
                                sweep_changed,
                                any_change,
                            });
                            return Ok(PoolOutcome::Break);
                        }
                    }
                }
            }

            if !sweep_changed {
                break;
            }
            sweep += 1;
            if sweep >= max_sweeps {
                return Err(Error::RuleNontermination(max_sweeps));
            }
            cursor = None;
            sweep_changed = false;
        }
        Ok(PoolOutcome::Complete(any_change))
    }

    /// Writes per-rule statistics into `out`.
    pub fn print_statistics(&self, out: &mut String) {
        use std::fmt::Write;
        for rule in &self.rules {
            if rule.count_tests > 0 {
                let _ = writeln!(
                    out,
                    "{}: tests={} apply={}",
                    rule.name, rule.count_tests, rule.count_apply
                );
            }
        }
    }
}

impl Default for RulePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the full rule library, one entry per registered rule.
#[must_use]
pub fn universal_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "collapseconstants",
            "analysis",
            Vec::new(),
            arithmetic::rule_collapse_constants,
        ),
        Rule::new(
            "identity",
            "analysis",
            vec![
                OpCode::IntAdd,
                OpCode::IntSub,
                OpCode::IntXor,
                OpCode::IntAnd,
                OpCode::IntOr,
                OpCode::IntMult,
                OpCode::IntLeft,
                OpCode::IntRight,
                OpCode::IntSRight,
                OpCode::IntDiv,
                OpCode::BoolXor,
                OpCode::BoolAnd,
                OpCode::BoolOr,
            ],
            arithmetic::rule_algebraic_identity,
        ),
        Rule::new(
            "copyprop",
            "analysis",
            vec![OpCode::Copy],
            copyprop::rule_copy_propagate,
        ),
        Rule::new(
            "trivialphi",
            "analysis",
            vec![OpCode::MultiEqual],
            copyprop::rule_trivial_phi,
        ),
        Rule::new(
            "lessequal",
            "analysis",
            vec![OpCode::IntLessEqual, OpCode::IntSLessEqual],
            comparison::rule_less_equal,
        ),
        Rule::new(
            "doublenegate",
            "analysis",
            vec![OpCode::BoolNegate],
            comparison::rule_double_negate,
        ),
        Rule::new(
            "branchnegate",
            "analysis",
            vec![OpCode::CBranch],
            comparison::rule_branch_negate,
        ),
        Rule::new(
            "constbranch",
            "analysis",
            vec![OpCode::CBranch],
            comparison::rule_constant_branch,
        ),
        Rule::new(
            "subpiecepiece",
            "analysis",
            vec![OpCode::SubPiece],
            arithmetic::rule_subpiece_of_piece,
        ),
    ]
}

//! Fixed-point worklist driver generic over an abstract state domain.
//!
//! [`Analyzer`] owns the per-position `in`/`out` state arrays of one analysis
//! run and drives a [`Domain`] to a fixed point over the shared
//! [`ControlFlow`]. The state type is fully generic: the frame-based
//! analyses run through the dispatch layer's
//! [`FrameDomain`](crate::analysis::FrameDomain) adapter, while passes with
//! non-frame state (such as the stage graph's control-edge registration)
//! implement [`Domain`] directly.
//!
//! # Life Cycle
//!
//! `NotStarted → FlowBuilt → InProgress → Converged`. A child analyzer
//! created with [`Analyzer::child_of`] starts at `FlowBuilt`, reusing the
//! parent's control-flow arrays without recomputation.
//!
//! # Virtual Steps
//!
//! A transfer may call [`Step::resume`] to run the same position again
//! before the out-state is stored. The engine keeps a single in/out entry
//! per position regardless of how many virtual steps ran; successor
//! re-enqueuing is controlled per-target via [`Step::suppress_successor`].

use std::collections::BinaryHeap;
use std::fmt::Debug;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    analysis::flow::{CaughtException, ControlFlow},
    bytecode::{ConstPool, Instruction, MethodBody},
    Error, Result,
};

/// Progress of one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerState {
    /// Construction has not begun.
    NotStarted,
    /// Control flow is available; no states computed yet.
    FlowBuilt,
    /// The worklist loop is running.
    InProgress,
    /// The fixed point has been reached.
    Converged,
}

/// An abstract domain driven by the [`Analyzer`].
pub trait Domain {
    /// Abstract state attached to every program position.
    type State: Clone + PartialEq + Debug;

    /// State at the method entry.
    ///
    /// # Errors
    ///
    /// May fail when the method signature cannot be modeled.
    fn entry_state(&mut self, body: &MethodBody) -> Result<Self::State>;

    /// Joins two states flowing into `pos`.
    ///
    /// # Errors
    ///
    /// May fail on irreconcilable states (reported as bad code).
    fn merge(&mut self, pos: u32, a: &Self::State, b: &Self::State) -> Result<Self::State>;

    /// Derives the state observed by an exception handler at `pos` from a
    /// throwing predecessor's out-state.
    ///
    /// # Errors
    ///
    /// May fail on irreconcilable states.
    fn merge_exceptional(
        &mut self,
        pos: u32,
        pred_out: &Self::State,
        caught: &CaughtException,
    ) -> Result<Self::State>;

    /// Applies the effect of the instruction at `step.pos()` to `state`.
    ///
    /// # Errors
    ///
    /// Domain failures abort the analysis of this method.
    fn transfer(&mut self, step: &mut Step<'_>, state: &mut Self::State) -> Result<()>;

    /// Invoked when a position with no successors has been transferred:
    /// control falls off this position into the method exit.
    ///
    /// # Errors
    ///
    /// Domain failures abort the analysis of this method.
    fn exit(&mut self, _pos: u32, _state: &Self::State) -> Result<()> {
        Ok(())
    }
}

/// Per-transfer context handed to [`Domain::transfer`].
pub struct Step<'a> {
    pos: u32,
    virtual_step: u32,
    insn: &'a Instruction,
    flow: &'a ControlFlow,
    pool: &'a ConstPool,
    resume: bool,
    suppressed: SmallVec<[u32; 2]>,
}

impl<'a> Step<'a> {
    /// Byte offset of the instruction being transferred.
    #[must_use]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// Zero-based index of the current virtual step at this position.
    #[must_use]
    pub fn virtual_step(&self) -> u32 {
        self.virtual_step
    }

    /// The instruction being transferred.
    #[must_use]
    pub fn instruction(&self) -> &'a Instruction {
        self.insn
    }

    /// The shared control flow.
    #[must_use]
    pub fn flow(&self) -> &'a ControlFlow {
        self.flow
    }

    /// The constant pool of the declaring class.
    #[must_use]
    pub fn pool(&self) -> &'a ConstPool {
        self.pool
    }

    /// Normal successors of the current position.
    #[must_use]
    pub fn successors(&self) -> &'a [u32] {
        self.flow.successors(self.pos)
    }

    /// Requests another transfer of this position before the out-state is
    /// stored. The next call observes an incremented [`Step::virtual_step`].
    pub fn resume(&mut self) {
        self.resume = true;
    }

    /// Suppresses re-enqueuing of one successor after this transfer.
    pub fn suppress_successor(&mut self, succ: u32) {
        if !self.suppressed.contains(&succ) {
            self.suppressed.push(succ);
        }
    }

    /// Suppresses re-enqueuing of every successor after this transfer.
    pub fn suppress_all_successors(&mut self) {
        for &s in self.flow.successors(self.pos) {
            if !self.suppressed.contains(&s) {
                self.suppressed.push(s);
            }
        }
        for &s in self.flow.exceptional_successors(self.pos) {
            if !self.suppressed.contains(&s) {
                self.suppressed.push(s);
            }
        }
    }
}

/// Fixed-point analyzer over one method body.
pub struct Analyzer<D: Domain> {
    flow: Arc<ControlFlow>,
    insns: Arc<[Instruction]>,
    in_states: Vec<Option<D::State>>,
    out_states: Vec<Option<D::State>>,
    entry: Option<D::State>,
    state: AnalyzerState,
}

impl<D: Domain> Analyzer<D> {
    /// Decodes `body` and builds its control flow.
    ///
    /// # Errors
    ///
    /// Propagates decode and flow-construction failures.
    pub fn new(body: &MethodBody) -> Result<Self> {
        let insns: Arc<[Instruction]> = body.decode()?.into();
        let flow = Arc::new(ControlFlow::build(&insns, &body.handlers)?);
        Ok(Self::with_flow(flow, insns))
    }

    /// Creates an analyzer sharing another analyzer's control flow and
    /// instruction stream. The positions and edges are byte-identical by
    /// construction.
    #[must_use]
    pub fn child_of<E: Domain>(parent: &Analyzer<E>) -> Self {
        Self::with_flow(parent.flow.clone(), parent.insns.clone())
    }

    fn with_flow(flow: Arc<ControlFlow>, insns: Arc<[Instruction]>) -> Self {
        let len = flow.code_len();
        Analyzer {
            flow,
            insns,
            in_states: (0..len).map(|_| None).collect(),
            out_states: (0..len).map(|_| None).collect(),
            entry: None,
            state: AnalyzerState::FlowBuilt,
        }
    }

    /// The shared control flow.
    #[must_use]
    pub fn flow(&self) -> &Arc<ControlFlow> {
        &self.flow
    }

    /// The decoded instruction stream.
    #[must_use]
    pub fn instructions(&self) -> &Arc<[Instruction]> {
        &self.insns
    }

    /// Current life-cycle state.
    #[must_use]
    pub fn state(&self) -> AnalyzerState {
        self.state
    }

    /// In-state at `pos`, if the position was reached.
    #[must_use]
    pub fn in_state(&self, pos: u32) -> Option<&D::State> {
        self.in_states.get(pos as usize).and_then(Option::as_ref)
    }

    /// Out-state at `pos`, if the position was reached.
    #[must_use]
    pub fn out_state(&self, pos: u32) -> Option<&D::State> {
        self.out_states.get(pos as usize).and_then(Option::as_ref)
    }

    /// Runs `domain` to a fixed point.
    ///
    /// # Errors
    ///
    /// Any inconsistency or domain failure aborts with the offending
    /// position attached; the caller leaves the method unwoven.
    pub fn run(&mut self, body: &MethodBody, domain: &mut D) -> Result<()> {
        self.state = AnalyzerState::InProgress;
        self.entry = Some(domain.entry_state(body)?);

        let mut queued = vec![false; self.flow.code_len()];
        let mut worklist: BinaryHeap<(u32, u32)> = BinaryHeap::new();
        let mut enqueue = |worklist: &mut BinaryHeap<(u32, u32)>,
                           queued: &mut Vec<bool>,
                           pos: u32,
                           flow: &ControlFlow| {
            if !queued[pos as usize] {
                queued[pos as usize] = true;
                worklist.push((flow.priority(pos), pos));
            }
        };

        enqueue(&mut worklist, &mut queued, 0, &self.flow);
        // Handlers covering the entry have state available before any
        // predecessor transfers.
        for pos in 0..self.flow.code_len() as u32 {
            if self.flow.caught(pos).is_some() && self.flow.entry_covered(pos) {
                enqueue(&mut worklist, &mut queued, pos, &self.flow);
            }
        }

        while let Some((_, pos)) = worklist.pop() {
            queued[pos as usize] = false;

            let Some(incoming) = self.incoming_state(pos, domain)? else {
                // No predecessor has produced a state yet; a later transfer
                // will re-enqueue this position.
                continue;
            };
            if self.in_states[pos as usize].as_ref() == Some(&incoming) {
                continue;
            }

            let insn_idx = self.flow.instruction_index(pos).ok_or_else(|| {
                bad_code!(pos, "worklist position is not an instruction start")
            })?;

            let mut state = incoming.clone();
            self.in_states[pos as usize] = Some(incoming);

            let insns = self.insns.clone();
            let flow = self.flow.clone();
            let insn = &insns[insn_idx];

            // Suppression is per transfer: only the final virtual step's
            // set controls which successors get re-enqueued.
            let mut suppressed: SmallVec<[u32; 2]> = SmallVec::new();
            let mut virtual_step = 0u32;
            loop {
                let mut step = Step {
                    pos,
                    virtual_step,
                    insn,
                    flow: &flow,
                    pool: &body.pool,
                    resume: false,
                    suppressed: SmallVec::new(),
                };
                domain.transfer(&mut step, &mut state).map_err(|e| match e {
                    Error::Frame(msg) => bad_code!(pos, "{msg}"),
                    other => other,
                })?;
                let resume = step.resume;
                suppressed = step.suppressed;
                if !resume {
                    break;
                }
                virtual_step += 1;
            }

            let out_changed = self.out_states[pos as usize].as_ref() != Some(&state);
            self.out_states[pos as usize] = Some(state);
            if !out_changed {
                continue;
            }

            let normal = self.flow.successors(pos);
            let exceptional = self.flow.exceptional_successors(pos);
            if normal.is_empty() && exceptional.is_empty() {
                let out = self.out_states[pos as usize]
                    .as_ref()
                    .expect("out-state was just stored");
                domain.exit(pos, out)?;
            } else {
                for &succ in normal.iter().chain(exceptional) {
                    if !suppressed.contains(&succ) {
                        enqueue(&mut worklist, &mut queued, succ, &self.flow);
                    }
                }
            }
        }

        self.state = AnalyzerState::Converged;
        Ok(())
    }

    /// Computes the in-state of `pos` by merging predecessor out-states,
    /// special-casing zero, one and two contributions.
    fn incoming_state(&mut self, pos: u32, domain: &mut D) -> Result<Option<D::State>> {
        let mut candidates: SmallVec<[D::State; 2]> = SmallVec::new();

        if let Some(caught) = self.flow.caught(pos) {
            if self.flow.entry_covered(pos) {
                let entry = self.entry.as_ref().expect("entry state is set before looping");
                candidates.push(domain.merge_exceptional(pos, entry, caught)?);
            }
            for &q in self.flow.exceptional_predecessors(pos) {
                if let Some(out) = self.out_states[q as usize].as_ref() {
                    candidates.push(domain.merge_exceptional(pos, out, caught)?);
                }
            }
        } else {
            if pos == 0 {
                candidates.push(self.entry.clone().expect("entry state is set before looping"));
            }
            for &q in self.flow.predecessors(pos) {
                if let Some(out) = self.out_states[q as usize].as_ref() {
                    candidates.push(out.clone());
                }
            }
        }

        match candidates.len() {
            0 => {
                if self.in_states[pos as usize].is_some() {
                    return Err(bad_code!(pos, "predecessor state disappeared mid-analysis"));
                }
                Ok(None)
            }
            1 => Ok(Some(candidates.into_iter().next().expect("one candidate"))),
            2 => {
                let b = candidates.pop().expect("two candidates");
                let a = candidates.pop().expect("two candidates");
                Ok(Some(domain.merge(pos, &a, &b)?))
            }
            _ => {
                let mut iter = candidates.into_iter();
                let mut acc = iter.next().expect("at least three candidates");
                for next in iter {
                    acc = domain.merge(pos, &acc, &next)?;
                }
                Ok(Some(acc))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{opcode as op, MethodBuilder, MethodFlags};

    /// Counts how often each position is transferred; state is the set of
    /// positions seen on the path (as a sorted vec) so merges exercise the
    /// join logic.
    struct Trace {
        transfers: Vec<(u32, u32)>,
        exits: Vec<u32>,
    }

    impl Domain for Trace {
        type State = Vec<u32>;

        fn entry_state(&mut self, _body: &MethodBody) -> Result<Self::State> {
            Ok(Vec::new())
        }

        fn merge(&mut self, _pos: u32, a: &Self::State, b: &Self::State) -> Result<Self::State> {
            let mut out = a.clone();
            for v in b {
                if !out.contains(v) {
                    out.push(*v);
                }
            }
            out.sort_unstable();
            Ok(out)
        }

        fn merge_exceptional(
            &mut self,
            pos: u32,
            pred_out: &Self::State,
            _caught: &CaughtException,
        ) -> Result<Self::State> {
            let mut out = pred_out.clone();
            if !out.contains(&pos) {
                out.push(pos);
            }
            out.sort_unstable();
            Ok(out)
        }

        fn transfer(&mut self, step: &mut Step<'_>, state: &mut Self::State) -> Result<()> {
            self.transfers.push((step.pos(), step.virtual_step()));
            if !state.contains(&step.pos()) {
                state.push(step.pos());
                state.sort_unstable();
            }
            Ok(())
        }

        fn exit(&mut self, pos: u32, _state: &Self::State) -> Result<()> {
            self.exits.push(pos);
            Ok(())
        }
    }

    fn diamond() -> crate::bytecode::MethodBody {
        let mut b = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC).unwrap();
        let other = b.label();
        let join = b.label();
        b.op(op::ILOAD_0)
            .branch(op::IFEQ, other)
            .op(op::ICONST_1)
            .branch(op::GOTO, join)
            .bind(other)
            .op(op::ICONST_0)
            .bind(join)
            .op(op::IRETURN)
            .build()
            .unwrap()
    }

    #[test]
    fn reaches_fixed_point_and_calls_exit() {
        let body = diamond();
        let mut analyzer: Analyzer<Trace> = Analyzer::new(&body).unwrap();
        let mut domain = Trace {
            transfers: Vec::new(),
            exits: Vec::new(),
        };
        analyzer.run(&body, &mut domain).unwrap();
        assert_eq!(analyzer.state(), AnalyzerState::Converged);
        // The join at the return merged both arms.
        let in_at_ret = analyzer.in_state(9).unwrap();
        assert!(in_at_ret.contains(&4) && in_at_ret.contains(&8));
        assert_eq!(domain.exits, vec![9]);
    }

    #[test]
    fn stable_in_state_skips_re_transfer() {
        let body = diamond();
        let mut analyzer: Analyzer<Trace> = Analyzer::new(&body).unwrap();
        let mut domain = Trace {
            transfers: Vec::new(),
            exits: Vec::new(),
        };
        analyzer.run(&body, &mut domain).unwrap();
        let first = domain.transfers.len();

        // Re-running transfer at a converged position must reproduce the
        // stored out-state byte for byte.
        let stored_in = analyzer.in_state(0).unwrap().clone();
        let stored_out = analyzer.out_state(0).unwrap().clone();
        let mut replay = stored_in;
        let insns = analyzer.instructions().clone();
        let flow = analyzer.flow().clone();
        let mut step = Step {
            pos: 0,
            virtual_step: 0,
            insn: &insns[0],
            flow: &flow,
            pool: &body.pool,
            resume: false,
            suppressed: SmallVec::new(),
        };
        domain.transfer(&mut step, &mut replay).unwrap();
        assert_eq!(replay, stored_out);
        assert_eq!(domain.transfers.len(), first + 1);
    }

    #[test]
    fn child_shares_flow() {
        let body = diamond();
        let parent: Analyzer<Trace> = Analyzer::new(&body).unwrap();
        let child: Analyzer<Trace> = Analyzer::child_of(&parent);
        assert!(Arc::ptr_eq(parent.flow(), child.flow()));
        assert_eq!(child.state(), AnalyzerState::FlowBuilt);
    }
}

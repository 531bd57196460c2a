//! Control-flow construction: edges, exception routing, worklist priorities.
//!
//! The [`ControlFlow`] of a method is computed once per body and shared
//! read-only across every analysis of that body — positions and edges must
//! be identical across passes, so sharing is a correctness requirement and
//! not just an optimization.
//!
//! Edges are stored per byte position. Exceptional edges do not run from the
//! covered instruction itself but from each of its predecessors: an
//! instruction that throws has only partially executed, so the state a
//! handler can observe is the predecessor's out-state. A protected range
//! that covers the method entry marks its handler as entry-covered, which
//! makes the engine fold the entry state into the handler's input as well.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    bytecode::{ExceptionHandler, FlowKind, Instruction},
    Error, Result,
};

/// Exception metadata attached to a handler entry position.
#[derive(Debug, Clone, PartialEq)]
pub struct CaughtException {
    /// Internal name of the caught class; `None` catches everything.
    pub class: Option<Arc<str>>,
}

type EdgeList = SmallVec<[u32; 2]>;

/// The shared control-flow graph of one method body.
#[derive(Debug)]
pub struct ControlFlow {
    code_len: usize,
    /// Instruction index per starting byte offset.
    insn_at: Vec<Option<u32>>,
    predecessors: Vec<EdgeList>,
    successors: Vec<EdgeList>,
    exc_predecessors: Vec<EdgeList>,
    exc_successors: Vec<EdgeList>,
    caught: Vec<Option<CaughtException>>,
    /// Handler entries whose protected range includes the method entry.
    entry_covered: Vec<bool>,
    reachable: Vec<bool>,
    /// Worklist priority per position; higher values run earlier and
    /// approximate reverse postorder.
    priority: Vec<u32>,
}

impl ControlFlow {
    /// Builds the control-flow graph for a decoded instruction stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlowConstruction`] for branches that do not land on
    /// instruction starts, code that can fall off the end, malformed handler
    /// ranges, and handler entries that are also ordinary branch targets.
    pub fn build(insns: &[Instruction], handlers: &[ExceptionHandler]) -> Result<Self> {
        let code_len = insns
            .last()
            .map(Instruction::next_offset)
            .unwrap_or(0) as usize;
        if insns.is_empty() {
            return Err(Error::FlowConstruction("empty code array".into()));
        }

        let mut insn_at = vec![None; code_len];
        for (i, insn) in insns.iter().enumerate() {
            insn_at[insn.offset as usize] = Some(i as u32);
        }

        for h in handlers {
            let ok = h.start < h.end
                && (h.end as usize) <= code_len
                && insn_at.get(h.start as usize).copied().flatten().is_some()
                && insn_at.get(h.handler as usize).copied().flatten().is_some();
            if !ok {
                return Err(Error::FlowConstruction(format!(
                    "malformed exception handler {}..{} -> {}",
                    h.start, h.end, h.handler
                )));
            }
        }

        let insn = |offset: u32| -> Result<&Instruction> {
            insn_at
                .get(offset as usize)
                .copied()
                .flatten()
                .map(|i| &insns[i as usize])
                .ok_or_else(|| {
                    Error::FlowConstruction(format!(
                        "control transfer to {offset}, which is not an instruction start"
                    ))
                })
        };

        // Reachability over normal successors plus handler activation:
        // reaching any instruction of a protected range makes its handler
        // entry reachable.
        let mut reachable = vec![false; code_len];
        let mut worklist = vec![0u32];
        while let Some(pos) = worklist.pop() {
            if std::mem::replace(&mut reachable[pos as usize], true) {
                continue;
            }
            let current = insn(pos)?;
            for succ in current.successor_offsets() {
                if succ as usize >= code_len {
                    return Err(Error::FlowConstruction(format!(
                        "control falls off the end of code at {pos}"
                    )));
                }
                insn(succ)?;
                worklist.push(succ);
            }
            for h in handlers {
                if pos >= h.start && pos < h.end && !reachable[h.handler as usize] {
                    worklist.push(h.handler);
                }
            }
        }

        let mut flow = ControlFlow {
            code_len,
            insn_at,
            predecessors: vec![EdgeList::new(); code_len],
            successors: vec![EdgeList::new(); code_len],
            exc_predecessors: vec![EdgeList::new(); code_len],
            exc_successors: vec![EdgeList::new(); code_len],
            caught: vec![None; code_len],
            entry_covered: vec![false; code_len],
            reachable,
            priority: vec![0; code_len],
        };

        // Normal edges among reached positions.
        for i in insns {
            if !flow.reachable[i.offset as usize] {
                continue;
            }
            for succ in i.successor_offsets() {
                flow.successors[i.offset as usize].push(succ);
                flow.predecessors[succ as usize].push(i.offset);
            }
        }

        // Exceptional edges: from each position with a normal successor
        // inside the protected range to the handler entry.
        for h in handlers {
            let entry = h.handler as usize;
            if !flow.reachable[entry] {
                continue;
            }
            match &mut flow.caught[entry] {
                slot @ None => {
                    *slot = Some(CaughtException {
                        class: h.catch_type.clone(),
                    })
                }
                Some(existing) => {
                    // Two handlers sharing an entry widen to a catch-all.
                    if existing.class != h.catch_type {
                        existing.class = None;
                    }
                }
            }
            if h.start == 0 {
                flow.entry_covered[entry] = true;
            }
            for q in 0..code_len as u32 {
                if !flow.reachable[q as usize] {
                    continue;
                }
                let feeds_range = flow.successors[q as usize]
                    .iter()
                    .any(|&s| s >= h.start && s < h.end);
                if feeds_range && !flow.exc_successors[q as usize].contains(&h.handler) {
                    flow.exc_successors[q as usize].push(h.handler);
                    flow.exc_predecessors[entry].push(q);
                }
            }
        }

        // A handler entry that is also an ordinary branch target would need
        // two incompatible merge disciplines at one position.
        for pos in 0..code_len {
            if flow.caught[pos].is_some() && !flow.predecessors[pos].is_empty() {
                return Err(Error::FlowConstruction(format!(
                    "handler entry {pos} is also a normal branch target"
                )));
            }
        }

        flow.compute_priorities();
        Ok(flow)
    }

    /// Iterative depth-first reverse postorder. Recursion would overflow on
    /// large machine-generated methods, so the traversal keeps an explicit
    /// stack of (position, next-successor-index) pairs.
    fn compute_priorities(&mut self) {
        let n = self.code_len;
        let mut postorder_rank = vec![0u32; n];
        let mut next_rank = 0u32;
        let mut visited = vec![false; n];
        let mut stack: Vec<(u32, usize)> = Vec::new();

        visited[0] = true;
        stack.push((0, 0));
        while let Some(&(pos, next)) = stack.last() {
            let succs = &self.successors[pos as usize];
            let excs = &self.exc_successors[pos as usize];
            let total = succs.len() + excs.len();
            if next < total {
                let succ = if next < succs.len() {
                    succs[next]
                } else {
                    excs[next - succs.len()]
                };
                stack.last_mut().expect("non-empty stack").1 += 1;
                if !visited[succ as usize] {
                    visited[succ as usize] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder_rank[pos as usize] = next_rank;
                next_rank += 1;
                stack.pop();
            }
        }
        // Earlier in reverse postorder = higher priority.
        for pos in 0..n {
            if visited[pos] {
                self.priority[pos] = postorder_rank[pos] + 1;
            }
        }
    }

    /// Total code length in bytes; every per-position array is sized to it.
    #[must_use]
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Index into the instruction stream for the instruction starting at
    /// `offset`, or `None` between instruction starts.
    #[must_use]
    pub fn instruction_index(&self, offset: u32) -> Option<usize> {
        self.insn_at
            .get(offset as usize)
            .copied()
            .flatten()
            .map(|i| i as usize)
    }

    /// Normal predecessors of `pos`.
    #[must_use]
    pub fn predecessors(&self, pos: u32) -> &[u32] {
        &self.predecessors[pos as usize]
    }

    /// Normal successors of `pos`.
    #[must_use]
    pub fn successors(&self, pos: u32) -> &[u32] {
        &self.successors[pos as usize]
    }

    /// Exceptional predecessors of a handler entry.
    #[must_use]
    pub fn exceptional_predecessors(&self, pos: u32) -> &[u32] {
        &self.exc_predecessors[pos as usize]
    }

    /// Handler entries this position can transfer to exceptionally.
    #[must_use]
    pub fn exceptional_successors(&self, pos: u32) -> &[u32] {
        &self.exc_successors[pos as usize]
    }

    /// Caught-exception metadata if `pos` is a handler entry.
    #[must_use]
    pub fn caught(&self, pos: u32) -> Option<&CaughtException> {
        self.caught[pos as usize].as_ref()
    }

    /// Returns `true` if a protected range containing the method entry
    /// routes to this handler entry.
    #[must_use]
    pub fn entry_covered(&self, pos: u32) -> bool {
        self.entry_covered[pos as usize]
    }

    /// Returns `true` if `pos` is reachable from the method entry.
    #[must_use]
    pub fn is_reachable(&self, pos: u32) -> bool {
        self.reachable
            .get(pos as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Worklist priority of `pos`; higher runs earlier.
    #[must_use]
    pub fn priority(&self, pos: u32) -> u32 {
        self.priority[pos as usize]
    }

    /// Positions with neither normal nor exceptional successors, i.e. the
    /// method's normal and throwing exits.
    pub fn exit_positions(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.code_len as u32).filter(|&p| {
            self.is_reachable(p)
                && self.successors[p as usize].is_empty()
                && self.insn_at[p as usize].is_some()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{opcode as op, MethodBuilder, MethodFlags};

    fn flow_of(body: &crate::bytecode::MethodBody) -> (Vec<Instruction>, ControlFlow) {
        let insns = body.decode().unwrap();
        let flow = ControlFlow::build(&insns, &body.handlers).unwrap();
        (insns, flow)
    }

    #[test]
    fn straight_line_edges() {
        let body = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC)
            .unwrap()
            .op(op::ILOAD_0)
            .op(op::ICONST_1)
            .op(op::IADD)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let (_, flow) = flow_of(&body);
        assert_eq!(flow.successors(0), &[1]);
        assert_eq!(flow.predecessors(2), &[1]);
        assert!(flow.successors(3).is_empty());
        assert!(flow.priority(0) > flow.priority(3));
    }

    #[test]
    fn branch_join_and_priorities() {
        let mut b = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC).unwrap();
        let other = b.label();
        let join = b.label();
        let body = b
            .op(op::ILOAD_0) // 0
            .branch(op::IFEQ, other) // 1
            .op(op::ICONST_1) // 4
            .branch(op::GOTO, join) // 5
            .bind(other)
            .op(op::ICONST_0) // 8
            .bind(join)
            .op(op::IRETURN) // 9
            .build()
            .unwrap();
        let (_, flow) = flow_of(&body);
        let mut preds = flow.predecessors(9).to_vec();
        preds.sort_unstable();
        assert_eq!(preds, vec![5, 8]);
        assert!(flow.priority(1) > flow.priority(9));
    }

    #[test]
    fn exception_edges_run_from_predecessors() {
        let mut b = MethodBuilder::new("t/T", "f", "()I", MethodFlags::STATIC).unwrap();
        let try_start = b.label();
        let try_end = b.label();
        let handler = b.label();
        let body = b
            .bind(try_start)
            .op(op::ICONST_0) // 0
            .op(op::ICONST_1) // 1
            .op(op::IADD) // 2
            .op(op::IRETURN) // 3
            .bind(try_end)
            .bind(handler)
            .op(op::POP) // 4
            .op(op::ICONST_0) // 5
            .op(op::IRETURN) // 6
            .handler(try_start, try_end, handler, Some("java/lang/Exception"))
            .build()
            .unwrap();
        let (_, flow) = flow_of(&body);
        assert!(flow.caught(4).is_some());
        assert!(flow.entry_covered(4));
        // Positions feeding the protected range (0, 1, 2 feed 1, 2, 3).
        let mut exc_preds = flow.exceptional_predecessors(4).to_vec();
        exc_preds.sort_unstable();
        assert_eq!(exc_preds, vec![0, 1, 2]);
    }

    #[test]
    fn rejects_fall_off_end() {
        let body = MethodBuilder::new("t/T", "f", "()V", MethodFlags::STATIC)
            .unwrap()
            .op(op::NOP)
            .build()
            .unwrap();
        let insns = body.decode().unwrap();
        assert!(matches!(
            ControlFlow::build(&insns, &[]),
            Err(Error::FlowConstruction(_))
        ));
    }
}

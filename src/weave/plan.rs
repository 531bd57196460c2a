//! Edit plans: the weave analysis output applied to the instruction stream.
//!
//! An [`Edit`] attaches a sequence of synthetic instructions to one position
//! of the original stream. Edits are applied in a fixed, precedence-
//! respecting order: at one position the kinds apply as
//! [`EditKind::InsertBeforeExclusive`], then [`EditKind::InsertBefore`],
//! then [`EditKind::Rewrite`], then [`EditKind::InsertAfter`]; ties within
//! one kind break by the explicit precedence number, highest first, then by
//! insertion order. Duplicate edits collapse. This ordering is a fixed
//! protocol: several analyses may request edits at one instruction and the
//! outcome must not depend on which ran first.
//!
//! Branch operands inside an edit's code use *edit-local* instruction
//! indices; application rebases them onto the spliced stream.

use crate::bytecode::{opcode, Instruction, Operand};

/// How an edit attaches to its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EditKind {
    /// Before the very first instruction, bypassing the insert-before
    /// ordering at position zero; branches to the method entry do not
    /// execute this code.
    InsertBeforeExclusive,
    /// Before the instruction; branches to the instruction land on the
    /// first inserted instruction.
    InsertBefore,
    /// Replaces the instruction.
    Rewrite,
    /// After the instruction, before its fall-through successor.
    InsertAfter,
}

/// One planned edit.
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    /// Byte offset of the anchor instruction in the original stream.
    pub pos: u32,
    /// Attachment kind.
    pub kind: EditKind,
    /// Tie-break within one kind; highest applies first.
    pub precedence: i32,
    /// Synthetic instructions; branch operands are edit-local indices.
    pub code: Vec<Instruction>,
}

/// The ordered, deduplicated set of edits for one method.
#[derive(Debug, Default)]
pub struct EditPlan {
    edits: Vec<Edit>,
    temp_locals: u16,
}

impl EditPlan {
    /// Adds an edit; an identical edit already present is dropped.
    pub fn push(&mut self, edit: Edit) {
        if !self.edits.contains(&edit) {
            self.edits.push(edit);
        }
    }

    /// Returns `true` if nothing is planned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Number of planned edits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Reserves `count` synthetic local slots, returning the first index
    /// relative to the method's declared `max_locals`.
    pub fn reserve_temps(&mut self, count: u16) -> u16 {
        let first = self.temp_locals;
        self.temp_locals += count;
        first
    }

    /// Synthetic local slots the woven method needs beyond its declared
    /// `max_locals`.
    #[must_use]
    pub fn temp_locals(&self) -> u16 {
        self.temp_locals
    }

    /// Edits in application order.
    #[must_use]
    pub fn ordered(&self) -> Vec<&Edit> {
        let mut indexed: Vec<(usize, &Edit)> = self.edits.iter().enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| {
            a.pos
                .cmp(&b.pos)
                .then(a.kind.cmp(&b.kind))
                .then(b.precedence.cmp(&a.precedence))
                .then(ia.cmp(ib))
        });
        indexed.into_iter().map(|(_, e)| e).collect()
    }

    /// Edits of one kind at one position, in application order.
    pub fn at(&self, pos: u32, kind: EditKind) -> impl Iterator<Item = &Edit> {
        self.ordered()
            .into_iter()
            .filter(move |e| e.pos == pos && e.kind == kind)
    }
}

/// Builds a synthetic instruction for an edit sequence. Offsets and sizes
/// are assigned at application time.
pub(crate) fn synth(op: u8, operand: Operand) -> Instruction {
    let (_, mnemonic) = opcode::shape(op).expect("defined opcode");
    Instruction {
        offset: 0,
        opcode: op,
        mnemonic,
        operand,
        size: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode as op;

    fn edit(pos: u32, kind: EditKind, precedence: i32, opcode: u8) -> Edit {
        Edit {
            pos,
            kind,
            precedence,
            code: vec![synth(opcode, Operand::None)],
        }
    }

    #[test]
    fn kinds_apply_in_fixed_order() {
        let mut plan = EditPlan::default();
        plan.push(edit(4, EditKind::InsertAfter, 0, op::NOP));
        plan.push(edit(4, EditKind::Rewrite, 0, op::POP));
        plan.push(edit(4, EditKind::InsertBefore, 0, op::DUP));
        plan.push(edit(0, EditKind::InsertBeforeExclusive, 0, op::NOP));
        let kinds: Vec<EditKind> = plan.ordered().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EditKind::InsertBeforeExclusive,
                EditKind::InsertBefore,
                EditKind::Rewrite,
                EditKind::InsertAfter,
            ]
        );
    }

    #[test]
    fn precedence_breaks_ties_highest_first() {
        let mut plan = EditPlan::default();
        plan.push(edit(2, EditKind::InsertBefore, 1, op::NOP));
        plan.push(edit(2, EditKind::InsertBefore, 9, op::POP));
        plan.push(edit(2, EditKind::InsertBefore, 9, op::DUP));
        let ordered = plan.ordered();
        assert_eq!(ordered[0].code[0].opcode, op::POP);
        // Equal precedence falls back to insertion order.
        assert_eq!(ordered[1].code[0].opcode, op::DUP);
        assert_eq!(ordered[2].code[0].opcode, op::NOP);
    }

    #[test]
    fn identical_edits_collapse() {
        let mut plan = EditPlan::default();
        plan.push(edit(2, EditKind::InsertBefore, 0, op::NOP));
        plan.push(edit(2, EditKind::InsertBefore, 0, op::NOP));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn temp_reservation_accumulates() {
        let mut plan = EditPlan::default();
        assert_eq!(plan.reserve_temps(2), 0);
        assert_eq!(plan.reserve_temps(1), 2);
        assert_eq!(plan.temp_locals(), 3);
    }
}

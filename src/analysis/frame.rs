//! Stack-machine frame abstraction shared by every analysis domain.
//!
//! A [`Frame`] is one snapshot of the abstract machine: a fixed-size local
//! variable array plus a bounded operand stack, generic over the abstract
//! value type. Two-word values (`long`, `double`) occupy two consecutive
//! slots; the upper slot holds the [`Slot::High`] sentinel and may only be
//! touched through the paired accessors. Splitting a pair is a dataflow
//! error, reported eagerly rather than propagated as corrupt state.
//!
//! Frames are value objects: [`Frame::copy`], slot-wise
//! [`Frame::merge_with`] and `PartialEq` define the join semantics the
//! fixed-point engine relies on.

use std::fmt::Debug;

use crate::{Error, Result};

/// One local or stack slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<V> {
    /// No value has been written (or the value is dead after a merge).
    Empty,
    /// A single-slot value, or the low half of a two-word value.
    Value(V),
    /// The sentinel occupying the upper half of a two-word value.
    High,
}

impl<V> Slot<V> {
    /// Returns the contained value, if this is a [`Slot::Value`].
    pub fn value(&self) -> Option<&V> {
        match self {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// An abstract stack-machine frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<V> {
    locals: Vec<Slot<V>>,
    stack: Vec<Slot<V>>,
    max_stack: usize,
}

impl<V: Clone + PartialEq + Debug> Frame<V> {
    /// Creates an empty frame with the given slot budget.
    #[must_use]
    pub fn new(max_locals: u16, max_stack: u16) -> Self {
        Frame {
            locals: (0..max_locals).map(|_| Slot::Empty).collect(),
            stack: Vec::with_capacity(max_stack as usize),
            max_stack: max_stack as usize,
        }
    }

    /// Number of local slots.
    #[must_use]
    pub fn local_count(&self) -> u16 {
        self.locals.len() as u16
    }

    /// Current operand stack depth in slots.
    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.stack.len() as u16
    }

    /// Pushes a single-slot value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] on stack overflow.
    pub fn push(&mut self, value: V) -> Result<()> {
        if self.stack.len() >= self.max_stack {
            return Err(Error::Frame(format!(
                "stack overflow past {} slots",
                self.max_stack
            )));
        }
        self.stack.push(Slot::Value(value));
        Ok(())
    }

    /// Pushes a two-word value (low slot plus sentinel).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] on stack overflow.
    pub fn push2(&mut self, value: V) -> Result<()> {
        if self.stack.len() + 2 > self.max_stack {
            return Err(Error::Frame(format!(
                "stack overflow past {} slots",
                self.max_stack
            )));
        }
        self.stack.push(Slot::Value(value));
        self.stack.push(Slot::High);
        Ok(())
    }

    /// Pops a single-slot value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] on underflow or if the top slot is one half
    /// of a two-word value.
    pub fn pop(&mut self) -> Result<V> {
        match self.stack.pop() {
            Some(Slot::Value(v)) => Ok(v),
            Some(Slot::High) => Err(Error::Frame(
                "single-slot pop on the upper half of a two-word value".into(),
            )),
            Some(Slot::Empty) | None => Err(Error::Frame("stack underflow".into())),
        }
    }

    /// Pops a two-word value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] on underflow or if the top two slots do not
    /// form a sentinel/value pair.
    pub fn pop2(&mut self) -> Result<V> {
        match (self.stack.pop(), self.stack.pop()) {
            (Some(Slot::High), Some(Slot::Value(v))) => Ok(v),
            (a, b) => Err(Error::Frame(format!(
                "two-word pop on incompatible slots {b:?}, {a:?}"
            ))),
        }
    }

    /// Reads the stack slot `depth` positions below the top without popping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] if the stack is shallower than `depth`.
    pub fn peek(&self, depth: u16) -> Result<&Slot<V>> {
        let len = self.stack.len();
        let depth = depth as usize;
        if depth >= len {
            return Err(Error::Frame(format!(
                "peek at depth {depth} on a stack of {len}"
            )));
        }
        Ok(&self.stack[len - 1 - depth])
    }

    /// Replaces the stack slot `depth` positions below the top.
    ///
    /// The slot must currently hold a single-word value; rewriting half of a
    /// pair through this accessor is a frame error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] on bad depth or sentinel overwrite.
    pub fn set_stack(&mut self, depth: u16, value: V) -> Result<()> {
        let len = self.stack.len();
        let depth = depth as usize;
        if depth >= len {
            return Err(Error::Frame(format!(
                "stack write at depth {depth} on a stack of {len}"
            )));
        }
        let slot = &mut self.stack[len - 1 - depth];
        if matches!(slot, Slot::High) {
            return Err(Error::Frame(
                "stack write on the upper half of a two-word value".into(),
            ));
        }
        *slot = Slot::Value(value);
        Ok(())
    }

    /// Reads a single local slot. The sentinel of a two-word value is
    /// observable here by design.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] if `index` is out of range.
    pub fn local(&self, index: u16) -> Result<&Slot<V>> {
        self.locals
            .get(index as usize)
            .ok_or_else(|| Error::Frame(format!("local index {index} out of range")))
    }

    /// Writes a single local slot, dissolving any pair it overlaps.
    ///
    /// Overwriting the low half of a two-word value invalidates the stale
    /// sentinel above it; overwriting a sentinel invalidates the low half
    /// below. Both neighbors degrade to [`Slot::Empty`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] if `index` is out of range.
    pub fn set_local(&mut self, index: u16, value: V) -> Result<()> {
        let i = index as usize;
        if i >= self.locals.len() {
            return Err(Error::Frame(format!("local index {index} out of range")));
        }
        if matches!(self.locals[i], Slot::High) && i > 0 {
            self.locals[i - 1] = Slot::Empty;
        }
        if i + 1 < self.locals.len() && matches!(self.locals[i + 1], Slot::High) {
            // Only a pair rooted here owns that sentinel.
            if matches!(self.locals[i], Slot::Value(_)) {
                self.locals[i + 1] = Slot::Empty;
            }
        }
        self.locals[i] = Slot::Value(value);
        Ok(())
    }

    /// Reads a two-word local pair rooted at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] if the pair invariant does not hold at
    /// `index` (no value, or a missing sentinel at `index + 1`).
    pub fn local2(&self, index: u16) -> Result<&V> {
        let i = index as usize;
        match (self.locals.get(i), self.locals.get(i + 1)) {
            (Some(Slot::Value(v)), Some(Slot::High)) => Ok(v),
            (a, b) => Err(Error::Frame(format!(
                "two-word read at local {index} on slots {a:?}, {b:?}"
            ))),
        }
    }

    /// Writes a two-word local pair rooted at `index`, installing the
    /// sentinel at `index + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] if `index + 1` is out of range.
    pub fn set_local2(&mut self, index: u16, value: V) -> Result<()> {
        let i = index as usize;
        if i + 1 >= self.locals.len() {
            return Err(Error::Frame(format!(
                "two-word write at local {index} exceeds {} slots",
                self.locals.len()
            )));
        }
        if matches!(self.locals[i], Slot::High) && i > 0 {
            self.locals[i - 1] = Slot::Empty;
        }
        self.locals[i] = Slot::Value(value);
        self.locals[i + 1] = Slot::High;
        Ok(())
    }

    /// Produces an independent snapshot of this frame.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Produces a snapshot with the same locals and an empty stack.
    ///
    /// Used for exceptional merges, where the thrown value replaces the
    /// entire operand stack.
    #[must_use]
    pub fn copy_locals(&self) -> Self {
        Frame {
            locals: self.locals.clone(),
            stack: Vec::new(),
            max_stack: self.max_stack,
        }
    }

    /// Applies `f` to every value slot (locals and stack).
    ///
    /// Used by the value-flow analysis to rewrite every slot holding an
    /// uninitialized identity once the constructor call completes.
    pub fn map_values(&mut self, mut f: impl FnMut(&V) -> Option<V>) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if let Slot::Value(v) = slot {
                if let Some(replacement) = f(v) {
                    *slot = Slot::Value(replacement);
                }
            }
        }
    }

    /// Iterates over `(index, value)` for all populated local slots.
    pub fn local_values(&self) -> impl Iterator<Item = (u16, &V)> {
        self.locals.iter().enumerate().filter_map(|(i, slot)| {
            slot.value().map(|v| (i as u16, v))
        })
    }

    /// Iterates over `(depth, value)` for all stack value slots, where depth
    /// 0 is the top of the stack.
    pub fn stack_values(&self) -> impl Iterator<Item = (u16, &V)> {
        let len = self.stack.len();
        self.stack.iter().enumerate().filter_map(move |(i, slot)| {
            slot.value().map(|v| ((len - 1 - i) as u16, v))
        })
    }

    /// Merges `other` into a fresh frame, joining value slots with `join`.
    ///
    /// Slot kinds must agree structurally; a value meeting an `Empty` or a
    /// sentinel degrades to `Empty` for locals. Stack shapes that disagree
    /// are a bad-code error (the verifier guarantees equal stack shapes at
    /// join points).
    ///
    /// # Errors
    ///
    /// Propagates `join` errors and reports stack shape mismatches.
    pub fn merge_with(
        &self,
        other: &Self,
        mut join: impl FnMut(&V, &V) -> Result<V>,
    ) -> Result<Self> {
        if self.stack.len() != other.stack.len() || self.locals.len() != other.locals.len() {
            return Err(Error::Frame(format!(
                "merging frames of different shape: stack {}/{} locals {}/{}",
                self.stack.len(),
                other.stack.len(),
                self.locals.len(),
                other.locals.len()
            )));
        }
        let mut merged = Frame {
            locals: Vec::with_capacity(self.locals.len()),
            stack: Vec::with_capacity(self.stack.len()),
            max_stack: self.max_stack.max(other.max_stack),
        };
        for (a, b) in self.locals.iter().zip(&other.locals) {
            merged.locals.push(match (a, b) {
                (Slot::Value(x), Slot::Value(y)) => Slot::Value(join(x, y)?),
                (Slot::High, Slot::High) => Slot::High,
                // Disagreeing local slots are dead past the join.
                _ => Slot::Empty,
            });
        }
        for (a, b) in self.stack.iter().zip(&other.stack) {
            merged.stack.push(match (a, b) {
                (Slot::Value(x), Slot::Value(y)) => Slot::Value(join(x, y)?),
                (Slot::High, Slot::High) => Slot::High,
                (a, b) => {
                    return Err(Error::Frame(format!(
                        "stack slots disagree at a join: {a:?} vs {b:?}"
                    )))
                }
            });
        }
        Ok(merged)
    }

    /// Raw access to the stack slots, bottom first.
    #[must_use]
    pub fn stack_slots(&self) -> &[Slot<V>] {
        &self.stack
    }

    /// Pops one raw slot. The dispatch layer's shuffle handling validates
    /// pair integrity itself; everything else uses the typed accessors.
    pub(crate) fn pop_slot(&mut self) -> Result<Slot<V>> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Frame("stack underflow".into()))
    }

    /// Pushes one raw slot.
    pub(crate) fn push_slot(&mut self, slot: Slot<V>) -> Result<()> {
        if self.stack.len() >= self.max_stack {
            return Err(Error::Frame(format!(
                "stack overflow past {} slots",
                self.max_stack
            )));
        }
        self.stack.push(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_word_local_round_trip() {
        let mut frame: Frame<i64> = Frame::new(4, 4);
        frame.set_local2(1, 77).unwrap();
        assert_eq!(frame.local2(1).unwrap(), &77);
        // The upper slot reads as the sentinel through the single accessor.
        assert!(matches!(frame.local(2).unwrap(), Slot::High));
        // A two-word read rooted at the sentinel fails fast.
        assert!(frame.local2(2).is_err());
    }

    #[test]
    fn single_write_dissolves_pair() {
        let mut frame: Frame<i64> = Frame::new(4, 4);
        frame.set_local2(0, 5).unwrap();
        frame.set_local(1, 9).unwrap();
        assert!(frame.local2(0).is_err());
        assert!(matches!(frame.local(0).unwrap(), Slot::Empty));
    }

    #[test]
    fn stack_pair_discipline() {
        let mut frame: Frame<i32> = Frame::new(0, 4);
        frame.push2(1).unwrap();
        assert!(frame.pop().is_err()); // split attempt already consumed the sentinel state
        let mut frame: Frame<i32> = Frame::new(0, 4);
        frame.push2(1).unwrap();
        assert_eq!(frame.pop2().unwrap(), 1);
        assert!(frame.pop().is_err()); // underflow
    }

    #[test]
    fn merge_requires_equal_stack_shape() {
        let mut a: Frame<i32> = Frame::new(1, 4);
        let mut b: Frame<i32> = Frame::new(1, 4);
        a.push(1).unwrap();
        b.push(2).unwrap();
        let merged = a.merge_with(&b, |x, y| Ok(x + y)).unwrap();
        assert_eq!(merged.peek(0).unwrap().value(), Some(&3));

        b.push(9).unwrap();
        assert!(a.merge_with(&b, |x, y| Ok(x + y)).is_err());
    }

    #[test]
    fn disagreeing_locals_go_dead() {
        let mut a: Frame<i32> = Frame::new(2, 2);
        let mut b: Frame<i32> = Frame::new(2, 2);
        a.set_local(0, 1).unwrap();
        b.set_local2(0, 2).unwrap();
        let merged = a.merge_with(&b, |x, y| Ok(x + y)).unwrap();
        assert!(matches!(merged.local(0).unwrap(), Slot::Empty));
    }
}

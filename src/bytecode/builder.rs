//! Programmatic construction of method bodies.
//!
//! [`MethodBuilder`] assembles a [`MethodBody`] from mnemonic-level
//! operations with label-based branch targets, interning constant pool
//! entries on the fly. It exists for embedders that synthesize carrier glue
//! and for the test suite, which builds every scenario body through it.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{
    bytecode::{
        descriptor::MethodDescriptor,
        encoder,
        instruction::{Instruction, Operand},
        method::{ExceptionHandler, MethodBody, MethodFlags},
        opcode,
        pool::{ConstPool, PoolEntry},
    },
    Error, Result,
};

/// A branch target that is resolved when the body is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Pending handler registration (label space).
struct PendingHandler {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: Option<Arc<str>>,
}

/// Builds a [`MethodBody`] instruction by instruction.
///
/// # Examples
///
/// ```rust
/// use byteloom::bytecode::{MethodBuilder, MethodFlags, opcode};
///
/// let body = MethodBuilder::new("demo/Calc", "f", "(I)I", MethodFlags::STATIC)
///     .unwrap()
///     .op(opcode::ILOAD_0)
///     .op(opcode::ICONST_1)
///     .op(opcode::IADD)
///     .op(opcode::IRETURN)
///     .build()
///     .unwrap();
/// assert_eq!(body.code.len(), 4);
/// ```
pub struct MethodBuilder {
    class: Arc<str>,
    name: Arc<str>,
    descriptor: MethodDescriptor,
    flags: MethodFlags,
    max_stack: u16,
    max_locals: u16,
    insns: Vec<Instruction>,
    pool: ConstPool,
    pool_index: FxHashMap<String, u16>,
    labels: Vec<Option<usize>>,
    pending_branches: Vec<(usize, Label)>,
    pending_handlers: Vec<PendingHandler>,
}

impl MethodBuilder {
    /// Starts a builder for the given member.
    ///
    /// `max_locals` is seeded from the descriptor (receiver included for
    /// instance methods) and grows with explicit local operands;
    /// `max_stack` defaults to a generous bound and can be overridden.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the descriptor does not parse.
    pub fn new(
        class: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        descriptor: &str,
        flags: MethodFlags,
    ) -> Result<Self> {
        let descriptor = MethodDescriptor::parse(descriptor)?;
        let receiver = u16::from(!flags.contains(MethodFlags::STATIC));
        let max_locals = receiver + descriptor.param_slots();
        Ok(MethodBuilder {
            class: class.into(),
            name: name.into(),
            descriptor,
            flags,
            max_stack: 8,
            max_locals,
            insns: Vec::new(),
            pool: ConstPool::new(),
            pool_index: FxHashMap::default(),
            labels: Vec::new(),
            pending_branches: Vec::new(),
            pending_handlers: Vec::new(),
        })
    }

    fn push_insn(&mut self, op: u8, operand: Operand) -> &mut Self {
        let (_, mnemonic) = opcode::shape(op).expect("defined opcode");
        self.insns.push(Instruction {
            offset: 0,
            opcode: op,
            mnemonic,
            operand,
            size: 0,
        });
        self
    }

    /// Appends an operand-less instruction.
    pub fn op(mut self, op: u8) -> Self {
        self.push_insn(op, Operand::None);
        self
    }

    /// Appends an instruction with a local-variable operand, growing
    /// `max_locals` as needed.
    pub fn local_op(mut self, op: u8, index: u16) -> Self {
        // A two-word store at index i occupies i and i+1.
        let wide = matches!(
            op,
            opcode::LLOAD | opcode::DLOAD | opcode::LSTORE | opcode::DSTORE
        );
        let top = index + 1 + u16::from(wide);
        self.max_locals = self.max_locals.max(top);
        self.push_insn(op, Operand::Local(index));
        self
    }

    /// Appends `bipush`/`sipush` style immediates.
    pub fn imm(mut self, op: u8, value: i32) -> Self {
        self.push_insn(op, Operand::Immediate(value));
        self
    }

    /// Appends an `iinc`.
    pub fn iinc(mut self, local: u16, delta: i16) -> Self {
        self.max_locals = self.max_locals.max(local + 1);
        self.push_insn(opcode::IINC, Operand::Iinc { local, delta });
        self
    }

    /// Interns a pool entry and appends an instruction referencing it.
    pub fn pool_op(mut self, op: u8, entry: PoolEntry) -> Self {
        let index = self.intern(entry);
        self.push_insn(op, Operand::Pool(index));
        self
    }

    /// Interns an entry into the pool, deduplicating by debug rendering.
    pub fn intern(&mut self, entry: PoolEntry) -> u16 {
        let key = format!("{entry:?}");
        if let Some(&idx) = self.pool_index.get(&key) {
            return idx;
        }
        let idx = self.pool.push(entry);
        self.pool_index.insert(key, idx);
        idx
    }

    /// Creates a fresh, unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next appended instruction.
    pub fn bind(mut self, label: Label) -> Self {
        self.labels[label.0] = Some(self.insns.len());
        self
    }

    /// Appends a branch to `label`.
    pub fn branch(mut self, op: u8, label: Label) -> Self {
        self.pending_branches.push((self.insns.len(), label));
        self.push_insn(op, Operand::Branch(0));
        self
    }

    /// Registers an exception handler over `[start, end)` with entry
    /// `handler`; `catch_type` of `None` catches everything.
    pub fn handler(
        mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> Self {
        self.pending_handlers.push(PendingHandler {
            start,
            end,
            handler,
            catch_type: catch_type.map(Arc::from),
        });
        self
    }

    /// Overrides the declared operand stack bound.
    pub fn max_stack(mut self, depth: u16) -> Self {
        self.max_stack = depth;
        self
    }

    fn resolve(&self, label: Label) -> Result<usize> {
        self.labels[label.0]
            .ok_or_else(|| Error::Encode(format!("label {:?} was never bound", label)))
    }

    /// Lays out the instructions and produces the finished body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] for unbound labels or layout failures.
    pub fn build(mut self) -> Result<MethodBody> {
        for (insn_idx, label) in std::mem::take(&mut self.pending_branches) {
            let target = self.resolve(label)?;
            if target >= self.insns.len() {
                return Err(Error::Encode(format!(
                    "label {label:?} bound past the last instruction"
                )));
            }
            self.insns[insn_idx].operand = Operand::Branch(target as i32);
        }
        let (code, offsets) = encoder::assemble(&self.insns)?;
        let mut handlers = Vec::new();
        for pending in &self.pending_handlers {
            let start = offsets[self.resolve(pending.start)?];
            let end_idx = self.resolve(pending.end)?;
            let end = offsets
                .get(end_idx)
                .copied()
                .unwrap_or(code.len() as u32);
            handlers.push(ExceptionHandler {
                start,
                end,
                handler: offsets[self.resolve(pending.handler)?],
                catch_type: pending.catch_type.clone(),
            });
        }
        Ok(MethodBody {
            class: self.class,
            name: self.name,
            descriptor: self.descriptor,
            flags: self.flags,
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code,
            handlers,
            pool: Arc::new(self.pool),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode as op;

    #[test]
    fn builds_branching_body() {
        let mut b = MethodBuilder::new("demo/Abs", "abs", "(I)I", MethodFlags::STATIC).unwrap();
        let negative = b.label();
        let body = b
            .op(op::ILOAD_0)
            .branch(op::IFLT, negative)
            .op(op::ILOAD_0)
            .op(op::IRETURN)
            .bind(negative)
            .op(op::ILOAD_0)
            .op(op::INEG)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let insns = body.decode().unwrap();
        // ifeq-family operand is now a byte-relative offset.
        assert_eq!(insns[1].successor_offsets().len(), 2);
        assert_eq!(body.max_locals, 1);
    }

    #[test]
    fn unbound_label_fails() {
        let mut b = MethodBuilder::new("demo/X", "f", "()V", MethodFlags::STATIC).unwrap();
        let dangling = b.label();
        assert!(b.branch(op::GOTO, dangling).op(op::RETURN).build().is_err());
    }
}

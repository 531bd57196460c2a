//! Instruction dispatch: the ISA-to-semantics mapping every analysis builds on.
//!
//! [`FrameDomain`] adapts a [`Semantics`] implementation into an engine
//! [`Domain`] over [`Frame`] states. For each instruction it performs the
//! domain-independent work exactly once: computing branch and switch
//! targets, resolving constant-pool references into typed descriptors,
//! popping operands and pushing results with the correct slot widths, and
//! validating the slot-level legality of the stack shuffle family. Exactly
//! one semantic callback fires per logical operation; what the operation
//! *means* is entirely up to the domain.
//!
//! The semantic vocabulary is deliberately flat — explicit operator,
//! condition and element-type enums rather than per-opcode methods — so a
//! domain implements a couple dozen callbacks instead of two hundred.

use std::fmt::Debug;
use std::sync::Arc;

use crate::{
    analysis::{
        engine::{Domain, Step},
        flow::CaughtException,
        frame::{Frame, Slot},
    },
    bytecode::{
        opcode, BaseType, CallSiteRef, ClassRef, FieldRef, JavaType, MethodBody,
        MethodDescriptor, MethodHandleRef, MethodRef, Operand,
    },
    Error, Result,
};

/// Slot-typed view of a load/store/return operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordType {
    /// `int` and the int-compatible small types.
    Int,
    /// `long` (two slots).
    Long,
    /// `float`.
    Float,
    /// `double` (two slots).
    Double,
    /// Any reference.
    Reference,
}

impl WordType {
    /// Slots a value of this kind occupies.
    #[must_use]
    pub fn slots(self) -> u16 {
        match self {
            WordType::Long | WordType::Double => 2,
            _ => 1,
        }
    }
}

/// Numeric operand type of an arithmetic instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumType {
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
}

impl NumType {
    /// Slots a value of this type occupies.
    #[must_use]
    pub fn slots(self) -> u16 {
        match self {
            NumType::Long | NumType::Double => 2,
            _ => 1,
        }
    }
}

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
    /// Shift left.
    Shl,
    /// Arithmetic shift right.
    Shr,
    /// Logical shift right.
    Ushr,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
}

/// The five long/floating comparison instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    /// `lcmp`.
    Long,
    /// `fcmpl` (NaN compares as -1).
    FloatL,
    /// `fcmpg` (NaN compares as +1).
    FloatG,
    /// `dcmpl`.
    DoubleL,
    /// `dcmpg`.
    DoubleG,
}

/// Relational condition of a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Greater or equal.
    Ge,
    /// Greater than.
    Gt,
    /// Less or equal.
    Le,
}

/// Operand shape of a branch instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// `ifeq` family: one int against zero.
    IfZero(Cond),
    /// `if_icmp` family: two ints.
    IfICmp(Cond),
    /// `if_acmpeq`/`if_acmpne`: two references, `true` for the eq form.
    IfACmp(bool),
    /// `ifnull`/`ifnonnull`: one reference, `true` for the null form.
    IfNull(bool),
    /// Unconditional `goto`.
    Goto,
}

/// Array element type of an `*aload`/`*astore` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    /// `iaload`/`iastore`.
    Int,
    /// `laload`/`lastore` (two slots).
    Long,
    /// `faload`/`fastore`.
    Float,
    /// `daload`/`dastore` (two slots).
    Double,
    /// `aaload`/`aastore`.
    Reference,
    /// `baload`/`bastore` (also boolean arrays).
    Byte,
    /// `caload`/`castore`.
    Char,
    /// `saload`/`sastore`.
    Short,
}

impl ElemType {
    /// Slots one element occupies on the operand stack.
    #[must_use]
    pub fn slots(self) -> u16 {
        match self {
            ElemType::Long | ElemType::Double => 2,
            _ => 1,
        }
    }
}

/// The fifteen primitive conversion instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
#[allow(missing_docs)]
pub enum ConvKind {
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

impl ConvKind {
    /// Operand type consumed.
    #[must_use]
    pub fn from_ty(self) -> NumType {
        use ConvKind::*;
        match self {
            I2L | I2F | I2D | I2B | I2C | I2S => NumType::Int,
            L2I | L2F | L2D => NumType::Long,
            F2I | F2L | F2D => NumType::Float,
            D2I | D2L | D2F => NumType::Double,
        }
    }

    /// Result type produced (the narrowing int conversions produce int).
    #[must_use]
    pub fn to_ty(self) -> NumType {
        use ConvKind::*;
        match self {
            I2L | F2L | D2L => NumType::Long,
            I2F | L2F | D2F => NumType::Float,
            I2D | L2D | F2D => NumType::Double,
            L2I | F2I | D2I | I2B | I2C | I2S => NumType::Int,
        }
    }
}

/// Invocation kind of a call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    /// `invokevirtual`.
    Virtual,
    /// `invokespecial` (constructors, private and super calls).
    Special,
    /// `invokestatic`.
    Static,
    /// `invokeinterface`.
    Interface,
}

impl InvokeKind {
    /// Returns `true` if the call pops a receiver.
    #[must_use]
    pub fn has_receiver(self) -> bool {
        !matches!(self, InvokeKind::Static)
    }
}

/// `monitorenter` vs `monitorexit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOp {
    /// Acquire.
    Enter,
    /// Release.
    Exit,
}

/// A constant pushed by a literal instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstKind {
    /// `aconst_null`.
    Null,
    /// Int literal (`iconst_*`, `bipush`, `sipush`, `ldc` of an int).
    Int(i32),
    /// Long literal.
    Long(i64),
    /// Float literal.
    Float(f32),
    /// Double literal.
    Double(f64),
    /// String literal.
    Str(Arc<str>),
    /// Class literal.
    Class(ClassRef),
    /// Method handle literal.
    MethodHandle(MethodHandleRef),
    /// Method type literal.
    MethodType(MethodDescriptor),
}

impl ConstKind {
    /// Slots the pushed constant occupies.
    #[must_use]
    pub fn slots(&self) -> u16 {
        match self {
            ConstKind::Long(_) | ConstKind::Double(_) => 2,
            _ => 1,
        }
    }
}

/// Result of an invocation callback.
#[derive(Debug)]
pub struct InvokeOutcome<V> {
    /// The value pushed for the return, if the callee returns one.
    pub result: Option<V>,
    /// When set, every frame slot equal to the first value is rewritten to
    /// the second. Used for the `<init>` uninitialized-to-initialized
    /// transition, which must update every alias at once.
    pub replace_all: Option<(V, V)>,
}

impl<V> InvokeOutcome<V> {
    /// Outcome with just a return value (or none).
    #[must_use]
    pub fn returning(result: Option<V>) -> Self {
        InvokeOutcome {
            result,
            replace_all: None,
        }
    }
}

/// The per-operation abstract domain interface.
///
/// One implementation per analysis; the dispatch layer guarantees that pops,
/// pushes and slot widths are already handled when a callback fires. Operand
/// order in every callback is evaluation order (deepest stack operand
/// first), and the receiver of an instance call is `args[0]`.
#[allow(unused_variables)]
pub trait Semantics {
    /// The abstract value stored in each frame slot.
    type Value: Clone + PartialEq + Debug;

    /// Frame at the method entry: parameters (and receiver) in locals.
    ///
    /// # Errors
    ///
    /// May fail when the signature cannot be modeled.
    fn entry_frame(&mut self, body: &MethodBody) -> Result<Frame<Self::Value>>;

    /// Joins two slot values flowing together at `pos`.
    ///
    /// # Errors
    ///
    /// May fail on incompatible values.
    fn merge_values(&mut self, pos: u32, a: &Self::Value, b: &Self::Value) -> Result<Self::Value>;

    /// The value holding the caught exception at a handler entry.
    ///
    /// # Errors
    ///
    /// May fail when the caught class cannot be modeled.
    fn caught_value(&mut self, pos: u32, caught: &CaughtException) -> Result<Self::Value>;

    /// A literal/constant push.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn constant(&mut self, step: &mut Step<'_>, kind: &ConstKind) -> Result<Self::Value>;

    /// A local load; `value` is the slot content, the result is pushed.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn load(
        &mut self,
        step: &mut Step<'_>,
        ty: WordType,
        index: u16,
        value: &Self::Value,
    ) -> Result<Self::Value>;

    /// A local store; the result is written to the slot.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn store(
        &mut self,
        step: &mut Step<'_>,
        ty: WordType,
        index: u16,
        value: Self::Value,
    ) -> Result<Self::Value>;

    /// An array element read.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn array_load(
        &mut self,
        step: &mut Step<'_>,
        elem: ElemType,
        array: Self::Value,
        index: Self::Value,
    ) -> Result<Self::Value>;

    /// An array element write.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn array_store(
        &mut self,
        step: &mut Step<'_>,
        elem: ElemType,
        array: Self::Value,
        index: Self::Value,
        value: Self::Value,
    ) -> Result<()>;

    /// A binary arithmetic/bitwise operation. For shifts the right operand
    /// is always int-typed regardless of `ty`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn binary(
        &mut self,
        step: &mut Step<'_>,
        op: BinOp,
        ty: NumType,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value>;

    /// Numeric negation.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn negate(
        &mut self,
        step: &mut Step<'_>,
        ty: NumType,
        value: Self::Value,
    ) -> Result<Self::Value>;

    /// `iinc`: in-place increment of an int local.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn iinc(
        &mut self,
        step: &mut Step<'_>,
        index: u16,
        delta: i16,
        value: &Self::Value,
    ) -> Result<Self::Value>;

    /// A primitive conversion.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn convert(
        &mut self,
        step: &mut Step<'_>,
        kind: ConvKind,
        value: Self::Value,
    ) -> Result<Self::Value>;

    /// `lcmp`/`fcmp*`/`dcmp*`, producing an int.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn compare(
        &mut self,
        step: &mut Step<'_>,
        kind: CmpKind,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value>;

    /// A branch; `operands` are the popped comparison inputs (empty for
    /// `goto`). Targets are available through `step`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn branch(
        &mut self,
        step: &mut Step<'_>,
        kind: BranchKind,
        operands: &[Self::Value],
    ) -> Result<()> {
        Ok(())
    }

    /// A `tableswitch`/`lookupswitch` on the popped int.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn switch(&mut self, step: &mut Step<'_>, value: Self::Value) -> Result<()> {
        Ok(())
    }

    /// A return; `value` is `None` for `void`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn return_value(
        &mut self,
        step: &mut Step<'_>,
        value: Option<(WordType, Self::Value)>,
    ) -> Result<()> {
        Ok(())
    }

    /// `athrow` of the popped reference.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn throw(&mut self, step: &mut Step<'_>, value: Self::Value) -> Result<()> {
        Ok(())
    }

    /// A field read; `receiver` is `None` for `getstatic`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn get_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<Self::Value>,
    ) -> Result<Self::Value>;

    /// A field write; `receiver` is `None` for `putstatic`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn put_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<Self::Value>,
        value: Self::Value,
    ) -> Result<()>;

    /// An invocation; `args[0]` is the receiver for instance kinds.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn invoke(
        &mut self,
        step: &mut Step<'_>,
        kind: InvokeKind,
        method: &MethodRef,
        args: Vec<Self::Value>,
    ) -> Result<InvokeOutcome<Self::Value>>;

    /// An `invokedynamic` call.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn invoke_dynamic(
        &mut self,
        step: &mut Step<'_>,
        site: &CallSiteRef,
        args: Vec<Self::Value>,
    ) -> Result<Option<Self::Value>>;

    /// A `new` allocation (uninitialized until its `<init>` runs).
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn new_object(&mut self, step: &mut Step<'_>, class: &ClassRef) -> Result<Self::Value>;

    /// An array allocation. `array_ty` is the type of the *created array*
    /// and `counts` holds one popped length per dimension.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn new_array(
        &mut self,
        step: &mut Step<'_>,
        array_ty: &JavaType,
        counts: Vec<Self::Value>,
    ) -> Result<Self::Value>;

    /// `arraylength`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn array_length(&mut self, step: &mut Step<'_>, array: Self::Value) -> Result<Self::Value>;

    /// `checkcast`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn check_cast(
        &mut self,
        step: &mut Step<'_>,
        class: &ClassRef,
        value: Self::Value,
    ) -> Result<Self::Value>;

    /// `instanceof`, producing an int.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn instance_of(
        &mut self,
        step: &mut Step<'_>,
        class: &ClassRef,
        value: Self::Value,
    ) -> Result<Self::Value>;

    /// `monitorenter`/`monitorexit`.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn monitor(&mut self, step: &mut Step<'_>, op: MonitorOp, value: Self::Value) -> Result<()> {
        Ok(())
    }

    /// A synthetic boxing step produced by the boxing decomposition layer.
    ///
    /// # Errors
    ///
    /// The default rejects the call: a domain only sees it when wrapped in
    /// [`Boxed`](crate::analysis::Boxed).
    fn box_value(
        &mut self,
        step: &mut Step<'_>,
        prim: BaseType,
        value: Self::Value,
    ) -> Result<Self::Value> {
        Err(Error::Internal(
            "boxing step reached a domain without boxing decomposition".into(),
        ))
    }

    /// A synthetic unboxing step produced by the boxing decomposition layer.
    ///
    /// # Errors
    ///
    /// See [`Semantics::box_value`].
    fn unbox_value(
        &mut self,
        step: &mut Step<'_>,
        prim: BaseType,
        value: Self::Value,
    ) -> Result<Self::Value> {
        Err(Error::Internal(
            "unboxing step reached a domain without boxing decomposition".into(),
        ))
    }

    /// Invoked for positions where control falls into the method exit.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn exit(&mut self, pos: u32, frame: &Frame<Self::Value>) -> Result<()> {
        Ok(())
    }

    /// Continues a multi-step transfer at `step.virtual_step() > 0`.
    ///
    /// A domain that called [`Step::resume`] receives the follow-up here
    /// instead of a re-dispatch of the instruction, so operand pops are not
    /// repeated. Returns `true` if the step was consumed.
    ///
    /// # Errors
    ///
    /// Domain-specific.
    fn continue_step(
        &mut self,
        step: &mut Step<'_>,
        frame: &mut Frame<Self::Value>,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Adapter implementing the engine [`Domain`] for any [`Semantics`].
pub struct FrameDomain<S: Semantics> {
    /// The wrapped per-operation domain.
    pub semantics: S,
}

impl<S: Semantics> FrameDomain<S> {
    /// Wraps a semantics implementation.
    pub fn new(semantics: S) -> Self {
        FrameDomain { semantics }
    }

    /// Unwraps the semantics implementation.
    pub fn into_inner(self) -> S {
        self.semantics
    }
}

impl<S: Semantics> Domain for FrameDomain<S> {
    type State = Frame<S::Value>;

    fn entry_state(&mut self, body: &MethodBody) -> Result<Self::State> {
        self.semantics.entry_frame(body)
    }

    fn merge(&mut self, pos: u32, a: &Self::State, b: &Self::State) -> Result<Self::State> {
        let semantics = &mut self.semantics;
        a.merge_with(b, |x, y| semantics.merge_values(pos, x, y))
    }

    fn merge_exceptional(
        &mut self,
        pos: u32,
        pred_out: &Self::State,
        caught: &CaughtException,
    ) -> Result<Self::State> {
        let mut frame = pred_out.copy_locals();
        let value = self.semantics.caught_value(pos, caught)?;
        frame.push(value)?;
        Ok(frame)
    }

    fn transfer(&mut self, step: &mut Step<'_>, frame: &mut Self::State) -> Result<()> {
        if step.virtual_step() > 0 {
            if self.semantics.continue_step(step, frame)? {
                return Ok(());
            }
            return Err(Error::Internal(format!(
                "virtual step {} at {} has no continuation",
                step.virtual_step(),
                step.pos()
            )));
        }
        transfer_frame(&mut self.semantics, step, frame)
    }

    fn exit(&mut self, pos: u32, state: &Self::State) -> Result<()> {
        self.semantics.exit(pos, state)
    }
}

/// Pops one value of `ty`, honoring slot width.
fn pop_ty<V: Clone + PartialEq + Debug>(frame: &mut Frame<V>, wide: bool) -> Result<V> {
    if wide {
        frame.pop2()
    } else {
        frame.pop()
    }
}

/// Pushes one value of `ty`, honoring slot width.
fn push_ty<V: Clone + PartialEq + Debug>(frame: &mut Frame<V>, wide: bool, value: V) -> Result<()> {
    if wide {
        frame.push2(value)
    } else {
        frame.push(value)
    }
}

/// Pops the argument list of `descriptor` (no receiver), returning values in
/// declaration order.
fn pop_args<V: Clone + PartialEq + Debug>(
    frame: &mut Frame<V>,
    descriptor: &MethodDescriptor,
) -> Result<Vec<V>> {
    let mut args = Vec::with_capacity(descriptor.params.len());
    for param in descriptor.params.iter().rev() {
        args.push(pop_ty(frame, param.slots() == 2)?);
    }
    args.reverse();
    Ok(args)
}

/// Validated slot-level shuffle: pops `pops` slots and re-pushes them per
/// `pattern` (bottom-first indices into the popped slots, 0 = former top).
fn shuffle<V: Clone + PartialEq + Debug>(
    frame: &mut Frame<V>,
    pos: u32,
    pops: usize,
    pattern: &[usize],
) -> Result<()> {
    let mut temp: Vec<Slot<V>> = Vec::with_capacity(pops);
    for _ in 0..pops {
        temp.push(frame.pop_slot()?);
    }
    // A two-word pair appears as High at j with its value at j + 1; the
    // deepest popped slot therefore may never be a High.
    for (j, slot) in temp.iter().enumerate() {
        if matches!(slot, Slot::High)
            && !matches!(temp.get(j + 1), Some(Slot::Value(_)))
        {
            return Err(bad_code!(pos, "stack shuffle splits a two-word value"));
        }
        if matches!(slot, Slot::Empty) {
            return Err(bad_code!(pos, "stack shuffle on a dead slot"));
        }
    }
    for (k, &idx) in pattern.iter().enumerate() {
        let is_pair_value =
            matches!(temp[idx], Slot::Value(_)) && idx > 0 && matches!(temp[idx - 1], Slot::High);
        if is_pair_value && pattern.get(k + 1) != Some(&(idx - 1)) {
            return Err(bad_code!(pos, "stack shuffle separates a two-word pair"));
        }
        let is_high = matches!(temp[idx], Slot::High);
        if is_high && (k == 0 || pattern[k - 1] != idx + 1) {
            return Err(bad_code!(pos, "stack shuffle orphans a two-word sentinel"));
        }
        frame.push_slot(temp[idx].clone())?;
    }
    Ok(())
}

/// Transfers one instruction through `semantics`, mutating `frame` in place.
#[allow(clippy::too_many_lines)]
pub fn transfer_frame<S: Semantics>(
    semantics: &mut S,
    step: &mut Step<'_>,
    frame: &mut Frame<S::Value>,
) -> Result<()> {
    use crate::bytecode::opcode as op;
    let insn = step.instruction();
    let pos = step.pos();
    let opcode = insn.opcode;

    // Local helpers for decoding operand payloads.
    let local_index = || -> Result<u16> {
        match insn.operand {
            Operand::Local(idx) => Ok(idx),
            _ => Err(bad_code!(pos, "missing local operand")),
        }
    };
    let pool_index = || -> Result<u16> {
        match insn.operand {
            Operand::Pool(idx) => Ok(idx),
            _ => Err(bad_code!(pos, "missing pool operand")),
        }
    };

    match opcode {
        op::NOP => {}

        // ── Constants ──────────────────────────────────────────────────
        op::ACONST_NULL => {
            let v = semantics.constant(step, &ConstKind::Null)?;
            frame.push(v)?;
        }
        op::ICONST_M1..=op::ICONST_5 => {
            let value = i32::from(opcode) - i32::from(op::ICONST_0);
            let v = semantics.constant(step, &ConstKind::Int(value))?;
            frame.push(v)?;
        }
        op::LCONST_0 | op::LCONST_1 => {
            let value = i64::from(opcode - op::LCONST_0);
            let v = semantics.constant(step, &ConstKind::Long(value))?;
            frame.push2(v)?;
        }
        op::FCONST_0 | op::FCONST_1 | op::FCONST_2 => {
            let value = f32::from(opcode - op::FCONST_0);
            let v = semantics.constant(step, &ConstKind::Float(value))?;
            frame.push(v)?;
        }
        op::DCONST_0 | op::DCONST_1 => {
            let value = f64::from(opcode - op::DCONST_0);
            let v = semantics.constant(step, &ConstKind::Double(value))?;
            frame.push2(v)?;
        }
        op::BIPUSH | op::SIPUSH => {
            let value = match insn.operand {
                Operand::Immediate(v) => v,
                _ => return Err(bad_code!(pos, "missing immediate operand")),
            };
            let v = semantics.constant(step, &ConstKind::Int(value))?;
            frame.push(v)?;
        }
        op::LDC | op::LDC_W | op::LDC2_W => {
            let entry = step.pool().entry(pool_index()?)?;
            let kind = const_kind_of(entry, pos, opcode == op::LDC2_W)?;
            let wide = kind.slots() == 2;
            let v = semantics.constant(step, &kind)?;
            push_ty(frame, wide, v)?;
        }

        // ── Loads ──────────────────────────────────────────────────────
        op::ILOAD | op::FLOAD | op::ALOAD | op::LLOAD | op::DLOAD => {
            let ty = load_store_type(opcode);
            do_load(semantics, step, frame, ty, local_index()?)?;
        }
        op::ILOAD_0..=op::ALOAD_3 => {
            let base = opcode - op::ILOAD_0;
            let ty = [
                WordType::Int,
                WordType::Long,
                WordType::Float,
                WordType::Double,
                WordType::Reference,
            ][usize::from(base / 4)];
            do_load(semantics, step, frame, ty, u16::from(base % 4))?;
        }

        // ── Array loads ────────────────────────────────────────────────
        op::IALOAD..=op::SALOAD => {
            let elem = array_elem_type(opcode - op::IALOAD);
            let index = frame.pop()?;
            let array = frame.pop()?;
            let v = semantics.array_load(step, elem, array, index)?;
            push_ty(frame, elem.slots() == 2, v)?;
        }

        // ── Stores ─────────────────────────────────────────────────────
        op::ISTORE | op::FSTORE | op::ASTORE | op::LSTORE | op::DSTORE => {
            let ty = load_store_type(opcode);
            do_store(semantics, step, frame, ty, local_index()?)?;
        }
        op::ISTORE_0..=op::ASTORE_3 => {
            let base = opcode - op::ISTORE_0;
            let ty = [
                WordType::Int,
                WordType::Long,
                WordType::Float,
                WordType::Double,
                WordType::Reference,
            ][usize::from(base / 4)];
            do_store(semantics, step, frame, ty, u16::from(base % 4))?;
        }

        // ── Array stores ───────────────────────────────────────────────
        op::IASTORE..=op::SASTORE => {
            let elem = array_elem_type(opcode - op::IASTORE);
            let value = pop_ty(frame, elem.slots() == 2)?;
            let index = frame.pop()?;
            let array = frame.pop()?;
            semantics.array_store(step, elem, array, index, value)?;
        }

        // ── Stack shuffles ─────────────────────────────────────────────
        op::POP => shuffle(frame, pos, 1, &[])?,
        op::POP2 => shuffle(frame, pos, 2, &[])?,
        op::DUP => shuffle(frame, pos, 1, &[0, 0])?,
        op::DUP_X1 => shuffle(frame, pos, 2, &[0, 1, 0])?,
        op::DUP_X2 => shuffle(frame, pos, 3, &[0, 2, 1, 0])?,
        op::DUP2 => shuffle(frame, pos, 2, &[1, 0, 1, 0])?,
        op::DUP2_X1 => shuffle(frame, pos, 3, &[1, 0, 2, 1, 0])?,
        op::DUP2_X2 => shuffle(frame, pos, 4, &[1, 0, 3, 2, 1, 0])?,
        op::SWAP => shuffle(frame, pos, 2, &[0, 1])?,

        // ── Arithmetic ─────────────────────────────────────────────────
        op::IADD..=op::DREM => {
            let (bin_op, ty) = arith_op(opcode - op::IADD);
            let rhs = pop_ty(frame, ty.slots() == 2)?;
            let lhs = pop_ty(frame, ty.slots() == 2)?;
            let v = semantics.binary(step, bin_op, ty, lhs, rhs)?;
            push_ty(frame, ty.slots() == 2, v)?;
        }
        op::INEG..=op::DNEG => {
            let ty = [NumType::Int, NumType::Long, NumType::Float, NumType::Double]
                [usize::from(opcode - op::INEG)];
            let v = pop_ty(frame, ty.slots() == 2)?;
            let v = semantics.negate(step, ty, v)?;
            push_ty(frame, ty.slots() == 2, v)?;
        }
        op::ISHL..=op::LUSHR => {
            let (bin_op, ty) = shift_op(opcode);
            // The shift distance is always a single int slot.
            let rhs = frame.pop()?;
            let lhs = pop_ty(frame, ty.slots() == 2)?;
            let v = semantics.binary(step, bin_op, ty, lhs, rhs)?;
            push_ty(frame, ty.slots() == 2, v)?;
        }
        op::IAND..=op::LXOR => {
            let (bin_op, ty) = logic_op(opcode);
            let rhs = pop_ty(frame, ty.slots() == 2)?;
            let lhs = pop_ty(frame, ty.slots() == 2)?;
            let v = semantics.binary(step, bin_op, ty, lhs, rhs)?;
            push_ty(frame, ty.slots() == 2, v)?;
        }
        op::IINC => {
            let (index, delta) = match insn.operand {
                Operand::Iinc { local, delta } => (local, delta),
                _ => return Err(bad_code!(pos, "missing iinc operand")),
            };
            let current = match frame.local(index)? {
                Slot::Value(v) => v.clone(),
                other => {
                    return Err(bad_code!(pos, "iinc on a non-value slot {other:?}"));
                }
            };
            let updated = semantics.iinc(step, index, delta, &current)?;
            frame.set_local(index, updated)?;
        }

        // ── Conversions ────────────────────────────────────────────────
        op::I2L..=op::I2S => {
            let kind = conv_kind(opcode);
            let v = pop_ty(frame, kind.from_ty().slots() == 2)?;
            let v = semantics.convert(step, kind, v)?;
            push_ty(frame, kind.to_ty().slots() == 2, v)?;
        }

        // ── Comparisons ────────────────────────────────────────────────
        op::LCMP..=op::DCMPG => {
            let kind = [
                CmpKind::Long,
                CmpKind::FloatL,
                CmpKind::FloatG,
                CmpKind::DoubleL,
                CmpKind::DoubleG,
            ][usize::from(opcode - op::LCMP)];
            let wide = matches!(kind, CmpKind::Long | CmpKind::DoubleL | CmpKind::DoubleG);
            let rhs = pop_ty(frame, wide)?;
            let lhs = pop_ty(frame, wide)?;
            let v = semantics.compare(step, kind, lhs, rhs)?;
            frame.push(v)?;
        }

        // ── Branches ───────────────────────────────────────────────────
        op::IFEQ..=op::IFLE => {
            let cond = branch_cond(opcode - op::IFEQ);
            let v = frame.pop()?;
            semantics.branch(step, BranchKind::IfZero(cond), &[v])?;
        }
        op::IF_ICMPEQ..=op::IF_ICMPLE => {
            let cond = branch_cond(opcode - op::IF_ICMPEQ);
            let rhs = frame.pop()?;
            let lhs = frame.pop()?;
            semantics.branch(step, BranchKind::IfICmp(cond), &[lhs, rhs])?;
        }
        op::IF_ACMPEQ | op::IF_ACMPNE => {
            let rhs = frame.pop()?;
            let lhs = frame.pop()?;
            semantics.branch(
                step,
                BranchKind::IfACmp(opcode == op::IF_ACMPEQ),
                &[lhs, rhs],
            )?;
        }
        op::IFNULL | op::IFNONNULL => {
            let v = frame.pop()?;
            semantics.branch(step, BranchKind::IfNull(opcode == op::IFNULL), &[v])?;
        }
        op::GOTO | op::GOTO_W => {
            semantics.branch(step, BranchKind::Goto, &[])?;
        }
        op::TABLESWITCH | op::LOOKUPSWITCH => {
            let v = frame.pop()?;
            semantics.switch(step, v)?;
        }

        // ── Returns and throw ──────────────────────────────────────────
        op::IRETURN..=op::ARETURN => {
            let ty = [
                WordType::Int,
                WordType::Long,
                WordType::Float,
                WordType::Double,
                WordType::Reference,
            ][usize::from(opcode - op::IRETURN)];
            let v = pop_ty(frame, ty.slots() == 2)?;
            semantics.return_value(step, Some((ty, v)))?;
        }
        op::RETURN => semantics.return_value(step, None)?,
        op::ATHROW => {
            let v = frame.pop()?;
            semantics.throw(step, v)?;
        }

        // ── Fields ─────────────────────────────────────────────────────
        op::GETSTATIC | op::GETFIELD => {
            let field = step.pool().field_at(pool_index()?)?.clone();
            let receiver = if opcode == op::GETFIELD {
                Some(frame.pop()?)
            } else {
                None
            };
            let v = semantics.get_field(step, &field, receiver)?;
            push_ty(frame, field.descriptor.slots() == 2, v)?;
        }
        op::PUTSTATIC | op::PUTFIELD => {
            let field = step.pool().field_at(pool_index()?)?.clone();
            let value = pop_ty(frame, field.descriptor.slots() == 2)?;
            let receiver = if opcode == op::PUTFIELD {
                Some(frame.pop()?)
            } else {
                None
            };
            semantics.put_field(step, &field, receiver, value)?;
        }

        // ── Invocations ────────────────────────────────────────────────
        op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKESTATIC | op::INVOKEINTERFACE => {
            let kind = match opcode {
                op::INVOKEVIRTUAL => InvokeKind::Virtual,
                op::INVOKESPECIAL => InvokeKind::Special,
                op::INVOKESTATIC => InvokeKind::Static,
                _ => InvokeKind::Interface,
            };
            let method = step.pool().method_at(pool_index()?)?.clone();
            let mut args = pop_args(frame, &method.descriptor)?;
            if kind.has_receiver() {
                args.insert(0, frame.pop()?);
            }
            let outcome = semantics.invoke(step, kind, &method, args)?;
            if let Some((old, new)) = outcome.replace_all {
                frame.map_values(|v| (v == &old).then(|| new.clone()));
            }
            if let Some(result) = outcome.result {
                let ret = method
                    .descriptor
                    .ret
                    .as_ref()
                    .ok_or_else(|| bad_code!(pos, "void call produced a value"))?;
                push_ty(frame, ret.slots() == 2, result)?;
            }
        }
        op::INVOKEDYNAMIC => {
            let site = step.pool().call_site_at(pool_index()?)?.clone();
            let args = pop_args(frame, &site.descriptor)?;
            let result = semantics.invoke_dynamic(step, &site, args)?;
            if let Some(result) = result {
                let ret = site
                    .descriptor
                    .ret
                    .as_ref()
                    .ok_or_else(|| bad_code!(pos, "void call site produced a value"))?;
                push_ty(frame, ret.slots() == 2, result)?;
            }
        }

        // ── Objects and arrays ─────────────────────────────────────────
        op::NEW => {
            let class = step.pool().class_at(pool_index()?)?.clone();
            let v = semantics.new_object(step, &class)?;
            frame.push(v)?;
        }
        op::NEWARRAY => {
            let code = match insn.operand {
                Operand::ArrayType(code) => code,
                Operand::Immediate(v) => v as u8,
                _ => return Err(bad_code!(pos, "missing newarray operand")),
            };
            let elem = primitive_array_elem(code)
                .ok_or_else(|| bad_code!(pos, "invalid newarray element code {code}"))?;
            let array_ty = JavaType::Array(Box::new(elem));
            let count = frame.pop()?;
            let v = semantics.new_array(step, &array_ty, vec![count])?;
            frame.push(v)?;
        }
        op::ANEWARRAY => {
            let class = step.pool().class_at(pool_index()?)?.clone();
            let array_ty = JavaType::Array(Box::new(class_as_type(&class)));
            let count = frame.pop()?;
            let v = semantics.new_array(step, &array_ty, vec![count])?;
            frame.push(v)?;
        }
        op::MULTIANEWARRAY => {
            let (pool, dims) = match insn.operand {
                Operand::MultiArray { pool, dims } => (pool, dims),
                _ => return Err(bad_code!(pos, "missing multianewarray operand")),
            };
            if dims == 0 {
                return Err(bad_code!(pos, "multianewarray with zero dimensions"));
            }
            let class = step.pool().class_at(pool)?.clone();
            let array_ty = class_as_type(&class);
            let mut counts = Vec::with_capacity(usize::from(dims));
            for _ in 0..dims {
                counts.push(frame.pop()?);
            }
            counts.reverse();
            let v = semantics.new_array(step, &array_ty, counts)?;
            frame.push(v)?;
        }
        op::ARRAYLENGTH => {
            let array = frame.pop()?;
            let v = semantics.array_length(step, array)?;
            frame.push(v)?;
        }
        op::CHECKCAST => {
            let class = step.pool().class_at(pool_index()?)?.clone();
            let v = frame.pop()?;
            let v = semantics.check_cast(step, &class, v)?;
            frame.push(v)?;
        }
        op::INSTANCEOF => {
            let class = step.pool().class_at(pool_index()?)?.clone();
            let v = frame.pop()?;
            let v = semantics.instance_of(step, &class, v)?;
            frame.push(v)?;
        }
        op::MONITORENTER | op::MONITOREXIT => {
            let v = frame.pop()?;
            let monitor_op = if opcode == op::MONITORENTER {
                MonitorOp::Enter
            } else {
                MonitorOp::Exit
            };
            semantics.monitor(step, monitor_op, v)?;
        }

        other => return Err(bad_code!(pos, "unhandled opcode {:#04x}", other)),
    }
    Ok(())
}

fn do_load<S: Semantics>(
    semantics: &mut S,
    step: &mut Step<'_>,
    frame: &mut Frame<S::Value>,
    ty: WordType,
    index: u16,
) -> Result<()> {
    let wide = ty.slots() == 2;
    let value = if wide {
        frame.local2(index)?.clone()
    } else {
        match frame.local(index)? {
            Slot::Value(v) => v.clone(),
            other => {
                return Err(bad_code!(
                    step.pos(),
                    "load from local {index} holding {other:?}"
                ));
            }
        }
    };
    let result = semantics.load(step, ty, index, &value)?;
    push_ty(frame, wide, result)
}

fn do_store<S: Semantics>(
    semantics: &mut S,
    step: &mut Step<'_>,
    frame: &mut Frame<S::Value>,
    ty: WordType,
    index: u16,
) -> Result<()> {
    let wide = ty.slots() == 2;
    let value = pop_ty(frame, wide)?;
    let result = semantics.store(step, ty, index, value)?;
    if wide {
        frame.set_local2(index, result)
    } else {
        frame.set_local(index, result)
    }
}

fn load_store_type(opcode: u8) -> WordType {
    use crate::bytecode::opcode as op;
    match opcode {
        op::ILOAD | op::ISTORE => WordType::Int,
        op::LLOAD | op::LSTORE => WordType::Long,
        op::FLOAD | op::FSTORE => WordType::Float,
        op::DLOAD | op::DSTORE => WordType::Double,
        _ => WordType::Reference,
    }
}

fn array_elem_type(offset: u8) -> ElemType {
    [
        ElemType::Int,
        ElemType::Long,
        ElemType::Float,
        ElemType::Double,
        ElemType::Reference,
        ElemType::Byte,
        ElemType::Char,
        ElemType::Short,
    ][usize::from(offset)]
}

fn arith_op(offset: u8) -> (BinOp, NumType) {
    let ops = [BinOp::Add, BinOp::Sub, BinOp::Mul, BinOp::Div, BinOp::Rem];
    let tys = [NumType::Int, NumType::Long, NumType::Float, NumType::Double];
    (ops[usize::from(offset / 4)], tys[usize::from(offset % 4)])
}

fn shift_op(opcode: u8) -> (BinOp, NumType) {
    use crate::bytecode::opcode as op;
    let bin_op = match opcode {
        op::ISHL | op::LSHL => BinOp::Shl,
        op::ISHR | op::LSHR => BinOp::Shr,
        _ => BinOp::Ushr,
    };
    let ty = if (opcode - op::ISHL) % 2 == 0 {
        NumType::Int
    } else {
        NumType::Long
    };
    (bin_op, ty)
}

fn logic_op(opcode: u8) -> (BinOp, NumType) {
    use crate::bytecode::opcode as op;
    let bin_op = match opcode {
        op::IAND | op::LAND => BinOp::And,
        op::IOR | op::LOR => BinOp::Or,
        _ => BinOp::Xor,
    };
    let ty = if (opcode - op::IAND) % 2 == 0 {
        NumType::Int
    } else {
        NumType::Long
    };
    (bin_op, ty)
}

fn conv_kind(opcode: u8) -> ConvKind {
    use ConvKind::*;
    [
        I2L, I2F, I2D, L2I, L2F, L2D, F2I, F2L, F2D, D2I, D2L, D2F, I2B, I2C, I2S,
    ][usize::from(opcode - opcode::I2L)]
}

fn branch_cond(offset: u8) -> Cond {
    [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Gt, Cond::Le][usize::from(offset)]
}

fn primitive_array_elem(code: u8) -> Option<JavaType> {
    let base = match code {
        4 => BaseType::Boolean,
        5 => BaseType::Char,
        6 => BaseType::Float,
        7 => BaseType::Double,
        8 => BaseType::Byte,
        9 => BaseType::Short,
        10 => BaseType::Int,
        11 => BaseType::Long,
        _ => return None,
    };
    Some(JavaType::Base(base))
}

/// Interprets a class reference that may name an array type descriptor.
fn class_as_type(class: &ClassRef) -> JavaType {
    if class.name.starts_with('[') {
        JavaType::parse(&class.name).unwrap_or_else(|_| JavaType::Object(class.name.clone()))
    } else {
        JavaType::Object(class.name.clone())
    }
}

fn const_kind_of(
    entry: &crate::bytecode::PoolEntry,
    pos: u32,
    two_word: bool,
) -> Result<ConstKind> {
    use crate::bytecode::PoolEntry as E;
    let kind = match entry {
        E::Int(v) => ConstKind::Int(*v),
        E::Long(v) => ConstKind::Long(*v),
        E::Float(v) => ConstKind::Float(*v),
        E::Double(v) => ConstKind::Double(*v),
        E::Str(s) => ConstKind::Str(s.clone()),
        E::Class(c) => ConstKind::Class(c.clone()),
        E::MethodHandle(h) => ConstKind::MethodHandle(h.clone()),
        E::MethodType(d) => ConstKind::MethodType(d.clone()),
        other => {
            return Err(bad_code!(pos, "pool entry {other:?} is not loadable"));
        }
    };
    if two_word != (kind.slots() == 2) {
        return Err(bad_code!(pos, "ldc width does not match pool entry"));
    }
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_table_is_consistent() {
        assert_eq!(arith_op(0), (BinOp::Add, NumType::Int));
        assert_eq!(
            arith_op(opcode::DREM - opcode::IADD),
            (BinOp::Rem, NumType::Double)
        );
        assert_eq!(
            arith_op(opcode::LMUL - opcode::IADD),
            (BinOp::Mul, NumType::Long)
        );
    }

    #[test]
    fn shift_and_logic_tables() {
        assert_eq!(shift_op(opcode::LUSHR), (BinOp::Ushr, NumType::Long));
        assert_eq!(shift_op(opcode::ISHL), (BinOp::Shl, NumType::Int));
        assert_eq!(logic_op(opcode::LXOR), (BinOp::Xor, NumType::Long));
    }

    #[test]
    fn conversion_widths() {
        assert_eq!(ConvKind::I2D.to_ty().slots(), 2);
        assert_eq!(ConvKind::D2I.from_ty().slots(), 2);
        assert_eq!(ConvKind::I2B.to_ty(), NumType::Int);
    }

    #[test]
    fn shuffle_rejects_pair_splits() {
        let mut frame: Frame<i32> = Frame::new(0, 8);
        frame.push2(7).unwrap();
        // dup on a two-word top is illegal.
        assert!(shuffle(&mut frame, 0, 1, &[0, 0]).is_err());

        let mut frame: Frame<i32> = Frame::new(0, 8);
        frame.push2(7).unwrap();
        // dup2 duplicates the pair intact.
        shuffle(&mut frame, 0, 2, &[1, 0, 1, 0]).unwrap();
        assert_eq!(frame.pop2().unwrap(), 7);
        assert_eq!(frame.pop2().unwrap(), 7);
    }

    #[test]
    fn shuffle_rejects_swap_of_pair() {
        let mut frame: Frame<i32> = Frame::new(0, 8);
        frame.push2(7).unwrap();
        assert!(shuffle(&mut frame, 0, 2, &[0, 1]).is_err());
    }
}

//! Constant analysis: provably-constant values per slot.
//!
//! A lightweight pass that spares the weaver from staging overhead on
//! values it can prove constant: literals, arithmetic over concrete
//! operands (folded with the exact runtime width/truncation semantics,
//! including division by zero *not* folding), reads of un-staged
//! `static final` fields (symbolic constants keyed by the field, since the
//! compiled-in value cannot be read without class-initialization
//! guarantees), and non-capturing lambda factory call sites (keyed by the
//! implementation handle; capturing lambdas vary and are excluded).

use std::sync::Arc;

use crate::{
    analysis::{
        boxing::Boxed,
        dispatch::{
            BinOp, CmpKind, ConstKind, ConvKind, ElemType, FrameDomain, InvokeKind,
            InvokeOutcome, NumType, Semantics, WordType,
        },
        engine::{Analyzer, Step},
        flow::CaughtException,
        frame::Frame,
        typeflow::TypeAnalysis,
    },
    bytecode::{
        BaseType, CallSiteRef, ClassRef, FieldRef, JavaType, MethodBody, MethodHandleRef,
        MethodRef,
    },
    Result,
};

/// The payload of a known constant. Floating values are stored by bit
/// pattern so `NaN` compares equal to itself and fixed points converge.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstOperand {
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// `f32` bits.
    Float(u32),
    /// `f64` bits.
    Double(u64),
    /// String literal.
    Str(Arc<str>),
    /// The null reference.
    Null,
    /// Class literal.
    Class(ClassRef),
    /// Symbolic `static final` field value.
    Field(FieldRef),
    /// Behaviorally-constant lambda, keyed by its implementation handle.
    Handle(MethodHandleRef),
}

/// A provably-constant value.
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    /// The constant payload.
    pub value: ConstOperand,
    /// Whether the constant is a reference.
    pub is_reference: bool,
    /// Whether the numeric/string payload is known at analysis time
    /// (symbolic field and handle constants are not).
    pub is_concrete: bool,
}

impl Constant {
    fn int(v: i32) -> Self {
        Constant {
            value: ConstOperand::Int(v),
            is_reference: false,
            is_concrete: true,
        }
    }

    fn long(v: i64) -> Self {
        Constant {
            value: ConstOperand::Long(v),
            is_reference: false,
            is_concrete: true,
        }
    }

    fn float(v: f32) -> Self {
        Constant {
            value: ConstOperand::Float(v.to_bits()),
            is_reference: false,
            is_concrete: true,
        }
    }

    fn double(v: f64) -> Self {
        Constant {
            value: ConstOperand::Double(v.to_bits()),
            is_reference: false,
            is_concrete: true,
        }
    }

    /// The concrete numeric payload, if any.
    fn numeric(&self) -> Option<Num> {
        if !self.is_concrete {
            return None;
        }
        match self.value {
            ConstOperand::Int(v) => Some(Num::Int(v)),
            ConstOperand::Long(v) => Some(Num::Long(v)),
            ConstOperand::Float(bits) => Some(Num::Float(f32::from_bits(bits))),
            ConstOperand::Double(bits) => Some(Num::Double(f64::from_bits(bits))),
            _ => None,
        }
    }
}

/// A concrete numeric operand during folding.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Num {
    fn as_int(self) -> Option<i32> {
        match self {
            Num::Int(v) => Some(v),
            _ => None,
        }
    }
}

/// Slot value of the constant domain: `None` means "not provably constant".
pub type ConstVal = Option<Constant>;

/// Folds a binary operation with runtime numeric semantics. Returns `None`
/// whenever folding would diverge from execution (division by zero) or the
/// operands do not fit the operation.
fn fold_binary(op: BinOp, ty: NumType, lhs: &Num, rhs: &Num) -> Option<Constant> {
    match ty {
        NumType::Int => {
            let l = lhs.as_int()?;
            let r = rhs.as_int()?;
            let folded = match op {
                BinOp::Add => l.wrapping_add(r),
                BinOp::Sub => l.wrapping_sub(r),
                BinOp::Mul => l.wrapping_mul(r),
                BinOp::Div => {
                    if r == 0 {
                        return None;
                    }
                    l.wrapping_div(r)
                }
                BinOp::Rem => {
                    if r == 0 {
                        return None;
                    }
                    l.wrapping_rem(r)
                }
                BinOp::Shl => l.wrapping_shl(r as u32 & 0x1F),
                BinOp::Shr => l.wrapping_shr(r as u32 & 0x1F),
                BinOp::Ushr => ((l as u32) >> (r as u32 & 0x1F)) as i32,
                BinOp::And => l & r,
                BinOp::Or => l | r,
                BinOp::Xor => l ^ r,
            };
            Some(Constant::int(folded))
        }
        NumType::Long => {
            let l = match lhs {
                Num::Long(v) => *v,
                _ => return None,
            };
            let folded = match op {
                // Shift distances come from an int operand.
                BinOp::Shl => l.wrapping_shl(rhs.as_int()? as u32 & 0x3F),
                BinOp::Shr => l.wrapping_shr(rhs.as_int()? as u32 & 0x3F),
                BinOp::Ushr => ((l as u64) >> (rhs.as_int()? as u32 & 0x3F)) as i64,
                _ => {
                    let r = match rhs {
                        Num::Long(v) => *v,
                        _ => return None,
                    };
                    match op {
                        BinOp::Add => l.wrapping_add(r),
                        BinOp::Sub => l.wrapping_sub(r),
                        BinOp::Mul => l.wrapping_mul(r),
                        BinOp::Div => {
                            if r == 0 {
                                return None;
                            }
                            l.wrapping_div(r)
                        }
                        BinOp::Rem => {
                            if r == 0 {
                                return None;
                            }
                            l.wrapping_rem(r)
                        }
                        BinOp::And => l & r,
                        BinOp::Or => l | r,
                        BinOp::Xor => l ^ r,
                        _ => return None,
                    }
                }
            };
            Some(Constant::long(folded))
        }
        NumType::Float => {
            let (l, r) = match (lhs, rhs) {
                (Num::Float(l), Num::Float(r)) => (*l, *r),
                _ => return None,
            };
            let folded = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                BinOp::Rem => l % r,
                _ => return None,
            };
            Some(Constant::float(folded))
        }
        NumType::Double => {
            let (l, r) = match (lhs, rhs) {
                (Num::Double(l), Num::Double(r)) => (*l, *r),
                _ => return None,
            };
            let folded = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                BinOp::Rem => l % r,
                _ => return None,
            };
            Some(Constant::double(folded))
        }
    }
}

fn fold_convert(kind: ConvKind, value: &Num) -> Option<Constant> {
    use ConvKind::*;
    Some(match (kind, value) {
        (I2L, Num::Int(v)) => Constant::long(i64::from(*v)),
        (I2F, Num::Int(v)) => Constant::float(*v as f32),
        (I2D, Num::Int(v)) => Constant::double(f64::from(*v)),
        (L2I, Num::Long(v)) => Constant::int(*v as i32),
        (L2F, Num::Long(v)) => Constant::float(*v as f32),
        (L2D, Num::Long(v)) => Constant::double(*v as f64),
        (F2I, Num::Float(v)) => Constant::int(*v as i32),
        (F2L, Num::Float(v)) => Constant::long(*v as i64),
        (F2D, Num::Float(v)) => Constant::double(f64::from(*v)),
        (D2I, Num::Double(v)) => Constant::int(*v as i32),
        (D2L, Num::Double(v)) => Constant::long(*v as i64),
        (D2F, Num::Double(v)) => Constant::float(*v as f32),
        (I2B, Num::Int(v)) => Constant::int(i32::from(*v as i8)),
        (I2C, Num::Int(v)) => Constant::int(i32::from(*v as u16)),
        (I2S, Num::Int(v)) => Constant::int(i32::from(*v as i16)),
        _ => return None,
    })
}

fn fold_compare(kind: CmpKind, lhs: &Num, rhs: &Num) -> Option<Constant> {
    let ordering = match (kind, lhs, rhs) {
        (CmpKind::Long, Num::Long(l), Num::Long(r)) => Some(l.cmp(r)),
        (CmpKind::FloatL | CmpKind::FloatG, Num::Float(l), Num::Float(r)) => l.partial_cmp(r),
        (CmpKind::DoubleL | CmpKind::DoubleG, Num::Double(l), Num::Double(r)) => l.partial_cmp(r),
        _ => return None,
    };
    let result = match ordering {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        // Unordered: the L forms yield -1, the G forms +1.
        None => match kind {
            CmpKind::FloatL | CmpKind::DoubleL => -1,
            _ => 1,
        },
    };
    Some(Constant::int(result))
}

/// Constant-domain semantics; `is_staged` reports whether a field carries a
/// staging annotation (staged finals are not compile-time constants).
struct ConstSemantics<F> {
    is_staged: F,
}

impl<F: Fn(&FieldRef) -> bool> Semantics for ConstSemantics<F> {
    type Value = ConstVal;

    fn entry_frame(&mut self, body: &MethodBody) -> Result<Frame<ConstVal>> {
        let mut frame = Frame::new(body.max_locals, body.max_stack);
        let mut slot = 0u16;
        if !body.is_static() {
            frame.set_local(slot, None)?;
            slot += 1;
        }
        for param in &body.descriptor.params {
            if param.slots() == 2 {
                frame.set_local2(slot, None)?;
            } else {
                frame.set_local(slot, None)?;
            }
            slot += param.slots();
        }
        Ok(frame)
    }

    fn merge_values(&mut self, _pos: u32, a: &ConstVal, b: &ConstVal) -> Result<ConstVal> {
        Ok(if a == b { a.clone() } else { None })
    }

    fn caught_value(&mut self, _pos: u32, _caught: &CaughtException) -> Result<ConstVal> {
        Ok(None)
    }

    fn constant(&mut self, _step: &mut Step<'_>, kind: &ConstKind) -> Result<ConstVal> {
        Ok(Some(match kind {
            ConstKind::Null => Constant {
                value: ConstOperand::Null,
                is_reference: true,
                is_concrete: true,
            },
            ConstKind::Int(v) => Constant::int(*v),
            ConstKind::Long(v) => Constant::long(*v),
            ConstKind::Float(v) => Constant::float(*v),
            ConstKind::Double(v) => Constant::double(*v),
            ConstKind::Str(s) => Constant {
                value: ConstOperand::Str(s.clone()),
                is_reference: true,
                is_concrete: true,
            },
            ConstKind::Class(c) => Constant {
                value: ConstOperand::Class(c.clone()),
                is_reference: true,
                is_concrete: false,
            },
            ConstKind::MethodHandle(h) => Constant {
                value: ConstOperand::Handle(h.clone()),
                is_reference: true,
                is_concrete: false,
            },
            ConstKind::MethodType(_) => {
                return Ok(None);
            }
        }))
    }

    fn load(
        &mut self,
        _step: &mut Step<'_>,
        _ty: WordType,
        _index: u16,
        value: &ConstVal,
    ) -> Result<ConstVal> {
        Ok(value.clone())
    }

    fn store(
        &mut self,
        _step: &mut Step<'_>,
        _ty: WordType,
        _index: u16,
        value: ConstVal,
    ) -> Result<ConstVal> {
        Ok(value)
    }

    fn array_load(
        &mut self,
        _step: &mut Step<'_>,
        _elem: ElemType,
        _array: ConstVal,
        _index: ConstVal,
    ) -> Result<ConstVal> {
        Ok(None)
    }

    fn array_store(
        &mut self,
        _step: &mut Step<'_>,
        _elem: ElemType,
        _array: ConstVal,
        _index: ConstVal,
        _value: ConstVal,
    ) -> Result<()> {
        Ok(())
    }

    fn binary(
        &mut self,
        _step: &mut Step<'_>,
        op: BinOp,
        ty: NumType,
        lhs: ConstVal,
        rhs: ConstVal,
    ) -> Result<ConstVal> {
        let folded = match (
            lhs.as_ref().and_then(Constant::numeric),
            rhs.as_ref().and_then(Constant::numeric),
        ) {
            (Some(l), Some(r)) => fold_binary(op, ty, &l, &r),
            _ => None,
        };
        Ok(folded)
    }

    fn negate(
        &mut self,
        _step: &mut Step<'_>,
        _ty: NumType,
        value: ConstVal,
    ) -> Result<ConstVal> {
        Ok(value.as_ref().and_then(Constant::numeric).map(|n| match n {
            Num::Int(v) => Constant::int(v.wrapping_neg()),
            Num::Long(v) => Constant::long(v.wrapping_neg()),
            Num::Float(v) => Constant::float(-v),
            Num::Double(v) => Constant::double(-v),
        }))
    }

    fn iinc(
        &mut self,
        _step: &mut Step<'_>,
        _index: u16,
        delta: i16,
        value: &ConstVal,
    ) -> Result<ConstVal> {
        Ok(value
            .as_ref()
            .and_then(Constant::numeric)
            .and_then(Num::as_int)
            .map(|v| Constant::int(v.wrapping_add(i32::from(delta)))))
    }

    fn convert(
        &mut self,
        _step: &mut Step<'_>,
        kind: ConvKind,
        value: ConstVal,
    ) -> Result<ConstVal> {
        Ok(value
            .as_ref()
            .and_then(Constant::numeric)
            .and_then(|n| fold_convert(kind, &n)))
    }

    fn compare(
        &mut self,
        _step: &mut Step<'_>,
        kind: CmpKind,
        lhs: ConstVal,
        rhs: ConstVal,
    ) -> Result<ConstVal> {
        let folded = match (
            lhs.as_ref().and_then(Constant::numeric),
            rhs.as_ref().and_then(Constant::numeric),
        ) {
            (Some(l), Some(r)) => fold_compare(kind, &l, &r),
            _ => None,
        };
        Ok(folded)
    }

    fn get_field(
        &mut self,
        _step: &mut Step<'_>,
        field: &FieldRef,
        _receiver: Option<ConstVal>,
    ) -> Result<ConstVal> {
        // A static final without a staging annotation is a symbolic
        // constant: its identity is the field, its payload stays unknown.
        if field.is_static_final() && !(self.is_staged)(field) {
            return Ok(Some(Constant {
                value: ConstOperand::Field(field.clone()),
                is_reference: field.descriptor.is_reference(),
                is_concrete: false,
            }));
        }
        Ok(None)
    }

    fn put_field(
        &mut self,
        _step: &mut Step<'_>,
        _field: &FieldRef,
        _receiver: Option<ConstVal>,
        _value: ConstVal,
    ) -> Result<()> {
        Ok(())
    }

    fn invoke(
        &mut self,
        _step: &mut Step<'_>,
        _kind: InvokeKind,
        method: &MethodRef,
        _args: Vec<ConstVal>,
    ) -> Result<InvokeOutcome<ConstVal>> {
        Ok(InvokeOutcome::returning(
            method.descriptor.ret.as_ref().map(|_| None),
        ))
    }

    fn invoke_dynamic(
        &mut self,
        _step: &mut Step<'_>,
        site: &CallSiteRef,
        _args: Vec<ConstVal>,
    ) -> Result<Option<ConstVal>> {
        if site.descriptor.ret.is_none() {
            return Ok(None);
        }
        if site.is_non_capturing() {
            if let Some(handle) = site.lambda_impl_handle() {
                return Ok(Some(Some(Constant {
                    value: ConstOperand::Handle(handle.clone()),
                    is_reference: true,
                    is_concrete: false,
                })));
            }
        }
        Ok(Some(None))
    }

    fn new_object(&mut self, _step: &mut Step<'_>, _class: &ClassRef) -> Result<ConstVal> {
        Ok(None)
    }

    fn new_array(
        &mut self,
        _step: &mut Step<'_>,
        _array_ty: &JavaType,
        _counts: Vec<ConstVal>,
    ) -> Result<ConstVal> {
        Ok(None)
    }

    fn array_length(&mut self, _step: &mut Step<'_>, _array: ConstVal) -> Result<ConstVal> {
        Ok(None)
    }

    fn check_cast(
        &mut self,
        _step: &mut Step<'_>,
        _class: &ClassRef,
        value: ConstVal,
    ) -> Result<ConstVal> {
        Ok(value)
    }

    fn instance_of(
        &mut self,
        _step: &mut Step<'_>,
        _class: &ClassRef,
        _value: ConstVal,
    ) -> Result<ConstVal> {
        Ok(None)
    }

    fn box_value(
        &mut self,
        _step: &mut Step<'_>,
        _prim: BaseType,
        value: ConstVal,
    ) -> Result<ConstVal> {
        // The payload survives boxing, the box's identity does not.
        Ok(value.map(|c| Constant {
            is_reference: true,
            is_concrete: c.is_concrete,
            value: c.value,
        }))
    }

    fn unbox_value(
        &mut self,
        _step: &mut Step<'_>,
        _prim: BaseType,
        value: ConstVal,
    ) -> Result<ConstVal> {
        Ok(value.and_then(|c| {
            c.numeric().map(|_| Constant {
                is_reference: false,
                is_concrete: c.is_concrete,
                value: c.value,
            })
        }))
    }
}

/// The completed constant analysis of one method.
pub struct ConstantAnalysis {
    analyzer: Analyzer<FrameDomain<Boxed<ConstSemantics<Box<dyn Fn(&FieldRef) -> bool>>>>>,
}

impl ConstantAnalysis {
    /// Runs the constant pass, sharing the type analysis's control flow.
    /// `is_staged` reports whether a field is a staging boundary.
    ///
    /// # Errors
    ///
    /// Propagates analysis failures.
    pub fn run(
        body: &MethodBody,
        types: &TypeAnalysis,
        is_staged: impl Fn(&FieldRef) -> bool + 'static,
    ) -> Result<Self> {
        let mut analyzer = Analyzer::child_of(types.analyzer());
        let boxed_lookup: Box<dyn Fn(&FieldRef) -> bool> = Box::new(is_staged);
        let mut domain = FrameDomain::new(Boxed::new(ConstSemantics {
            is_staged: boxed_lookup,
        }));
        analyzer.run(body, &mut domain)?;
        Ok(ConstantAnalysis { analyzer })
    }

    /// Constant frame flowing into `pos`.
    #[must_use]
    pub fn frame_at(&self, pos: u32) -> Option<&Frame<ConstVal>> {
        self.analyzer.in_state(pos)
    }

    /// Constant at stack depth `depth` just before `pos`.
    #[must_use]
    pub fn stack_constant(&self, pos: u32, depth: u16) -> Option<&Constant> {
        self.frame_at(pos)?
            .peek(depth)
            .ok()?
            .value()?
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{opcode as op, FieldFlags, MethodBuilder, MethodFlags, PoolEntry};

    fn analyze(body: &MethodBody) -> ConstantAnalysis {
        let types = TypeAnalysis::run(body).unwrap();
        ConstantAnalysis::run(body, &types, |_| false).unwrap()
    }

    #[test]
    fn folds_integer_arithmetic() {
        let body = MethodBuilder::new("t/T", "f", "()I", MethodFlags::STATIC)
            .unwrap()
            .imm(op::BIPUSH, 6)
            .imm(op::BIPUSH, 7)
            .op(op::IMUL)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let consts = analyze(&body);
        let at_return = body.decode().unwrap().last().unwrap().offset;
        assert_eq!(
            consts.stack_constant(at_return, 0).unwrap().value,
            ConstOperand::Int(42)
        );
    }

    #[test]
    fn never_folds_division_by_zero() {
        for divider in [op::IDIV, op::IREM] {
            let body = MethodBuilder::new("t/T", "f", "()I", MethodFlags::STATIC)
                .unwrap()
                .imm(op::BIPUSH, 10)
                .op(op::ICONST_0)
                .op(divider)
                .op(op::IRETURN)
                .build()
                .unwrap();
            let consts = analyze(&body);
            let at_return = body.decode().unwrap().last().unwrap().offset;
            assert!(consts.stack_constant(at_return, 0).is_none());
        }
    }

    #[test]
    fn folds_division_like_the_runtime() {
        for (l, r) in [(7, 2), (-7, 2), (i32::MIN, -1), (100, -3)] {
            let body = MethodBuilder::new("t/T", "f", "()I", MethodFlags::STATIC)
                .unwrap()
                .pool_op(op::LDC, PoolEntry::Int(l))
                .pool_op(op::LDC, PoolEntry::Int(r))
                .op(op::IDIV)
                .op(op::IRETURN)
                .build()
                .unwrap();
            let consts = analyze(&body);
            let at_return = body.decode().unwrap().last().unwrap().offset;
            assert_eq!(
                consts.stack_constant(at_return, 0).unwrap().value,
                ConstOperand::Int(l.wrapping_div(r)),
                "folding {l} / {r}"
            );
        }
    }

    #[test]
    fn narrowing_conversions_truncate() {
        let body = MethodBuilder::new("t/T", "f", "()I", MethodFlags::STATIC)
            .unwrap()
            .pool_op(op::LDC, PoolEntry::Int(0x1_FF))
            .op(op::I2B)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let consts = analyze(&body);
        let at_return = body.decode().unwrap().last().unwrap().offset;
        assert_eq!(
            consts.stack_constant(at_return, 0).unwrap().value,
            ConstOperand::Int(-1)
        );
    }

    #[test]
    fn unstaged_static_final_reads_are_symbolic() {
        let field = FieldRef {
            class: ClassRef::new("t/Config"),
            name: Arc::from("LIMIT"),
            descriptor: JavaType::parse("I").unwrap(),
            flags: FieldFlags::STATIC | FieldFlags::FINAL,
        };
        let body = MethodBuilder::new("t/T", "f", "()I", MethodFlags::STATIC)
            .unwrap()
            .pool_op(op::GETSTATIC, PoolEntry::Field(field.clone()))
            .op(op::IRETURN)
            .build()
            .unwrap();
        let consts = analyze(&body);
        let at_return = body.decode().unwrap().last().unwrap().offset;
        let constant = consts.stack_constant(at_return, 0).unwrap();
        assert!(!constant.is_concrete);
        assert_eq!(constant.value, ConstOperand::Field(field));

        // The same field under a staging annotation is not constant.
        let types = TypeAnalysis::run(&body).unwrap();
        let staged = ConstantAnalysis::run(&body, &types, |_| true).unwrap();
        assert!(staged.stack_constant(at_return, 0).is_none());
    }

    #[test]
    fn merge_of_disagreeing_constants_is_unknown() {
        let mut b = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC).unwrap();
        let other = b.label();
        let join = b.label();
        let body = b
            .op(op::ILOAD_0)
            .branch(op::IFEQ, other)
            .op(op::ICONST_1)
            .branch(op::GOTO, join)
            .bind(other)
            .op(op::ICONST_0)
            .bind(join)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let consts = analyze(&body);
        assert!(consts.stack_constant(9, 0).is_none());
    }
}

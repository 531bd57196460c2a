//! Type analysis: static slot types at every program point.
//!
//! The first pass of the pipeline. It assigns every stack and local slot a
//! [`TypeVal`] at every position and doubles as a lightweight verifier:
//! every instruction's transfer checks that the operand types it consumes
//! are assignable to what the instruction expects, and raises a
//! verification error otherwise. Later passes treat the result as ground
//! truth for slot widths, field/array element types and conversion safety.
//!
//! The reference-type model is deliberately simple: distinct reference
//! types merge straight to `java/lang/Object` instead of computing a common
//! ancestor, and intersection types arising from interface casts are not
//! modeled. The surrounding passes assume exactly this conservatism.

use std::sync::Arc;

use crate::{
    analysis::{
        dispatch::{
            BranchKind, CmpKind, ConstKind, ConvKind, ElemType, FrameDomain, InvokeKind,
            InvokeOutcome, MonitorOp, NumType, Semantics, WordType,
        },
        engine::{Analyzer, Step},
        flow::CaughtException,
        frame::Frame,
    },
    bytecode::{
        BaseType, CallSiteRef, ClassRef, FieldRef, JavaType, MethodBody, MethodDescriptor,
        MethodRef,
    },
    Error, Result,
};

/// The abstract type of one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeVal {
    /// `int` and every int-compatible small type.
    Int,
    /// `float`.
    Float,
    /// `long`.
    Long,
    /// `double`.
    Double,
    /// The null reference.
    Null,
    /// An object or array reference.
    Reference(JavaType),
    /// A `new` result before its constructor ran.
    Uninit {
        /// Position of the allocating `new`.
        at: u32,
        /// Class being constructed.
        class: ClassRef,
    },
    /// `this` inside a constructor, before the superclass constructor ran.
    UninitThis(ClassRef),
    /// Conflicting merge result; any use is a verification error.
    Bogus,
}

impl TypeVal {
    /// Maps a declared type to its slot value.
    #[must_use]
    pub fn of(ty: &JavaType) -> Self {
        match ty {
            JavaType::Base(BaseType::Long) => TypeVal::Long,
            JavaType::Base(BaseType::Double) => TypeVal::Double,
            JavaType::Base(BaseType::Float) => TypeVal::Float,
            JavaType::Base(_) => TypeVal::Int,
            reference => TypeVal::Reference(reference.clone()),
        }
    }

    /// Returns `true` for any reference-kind value, initialized or not.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeVal::Null | TypeVal::Reference(_) | TypeVal::Uninit { .. } | TypeVal::UninitThis(_)
        )
    }

    fn matches_word(&self, ty: WordType) -> bool {
        match ty {
            WordType::Int => matches!(self, TypeVal::Int),
            WordType::Float => matches!(self, TypeVal::Float),
            WordType::Long => matches!(self, TypeVal::Long),
            WordType::Double => matches!(self, TypeVal::Double),
            WordType::Reference => self.is_reference(),
        }
    }

    fn matches_num(&self, ty: NumType) -> bool {
        matches!(
            (self, ty),
            (TypeVal::Int, NumType::Int)
                | (TypeVal::Float, NumType::Float)
                | (TypeVal::Long, NumType::Long)
                | (TypeVal::Double, NumType::Double)
        )
    }
}

fn verify(pos: u32, ok: bool, message: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Verification {
            message: message(),
            pos,
        })
    }
}

/// Semantics of the type domain.
pub struct TypeSemantics {
    return_type: Option<JavaType>,
}

impl TypeSemantics {
    fn check_word(&self, pos: u32, v: &TypeVal, ty: WordType) -> Result<()> {
        verify(pos, v.matches_word(ty), || {
            format!("{v:?} is not assignable to a {ty:?} operand")
        })
    }

    fn check_num(&self, pos: u32, v: &TypeVal, ty: NumType) -> Result<()> {
        verify(pos, v.matches_num(ty), || {
            format!("{v:?} is not a {ty:?} operand")
        })
    }

    fn check_initialized_ref(&self, pos: u32, v: &TypeVal) -> Result<()> {
        verify(
            pos,
            matches!(v, TypeVal::Null | TypeVal::Reference(_)),
            || format!("{v:?} is not an initialized reference"),
        )
    }

    fn num_result(ty: NumType) -> TypeVal {
        match ty {
            NumType::Int => TypeVal::Int,
            NumType::Float => TypeVal::Float,
            NumType::Long => TypeVal::Long,
            NumType::Double => TypeVal::Double,
        }
    }
}

impl Semantics for TypeSemantics {
    type Value = TypeVal;

    fn entry_frame(&mut self, body: &MethodBody) -> Result<Frame<TypeVal>> {
        let mut frame = Frame::new(body.max_locals, body.max_stack);
        let mut slot = 0u16;
        if !body.is_static() {
            let receiver = if body.is_constructor() {
                TypeVal::UninitThis(ClassRef::new(body.class.clone()))
            } else {
                TypeVal::Reference(JavaType::Object(body.class.clone()))
            };
            frame.set_local(slot, receiver)?;
            slot += 1;
        }
        for param in &body.descriptor.params {
            if param.slots() == 2 {
                frame.set_local2(slot, TypeVal::of(param))?;
            } else {
                frame.set_local(slot, TypeVal::of(param))?;
            }
            slot += param.slots();
        }
        self.return_type = body.descriptor.ret.clone();
        Ok(frame)
    }

    fn merge_values(&mut self, _pos: u32, a: &TypeVal, b: &TypeVal) -> Result<TypeVal> {
        if a == b {
            return Ok(a.clone());
        }
        Ok(match (a, b) {
            (TypeVal::Null, TypeVal::Reference(t)) | (TypeVal::Reference(t), TypeVal::Null) => {
                TypeVal::Reference(t.clone())
            }
            // Simplified model: distinct references fall back to Object.
            (TypeVal::Reference(_), TypeVal::Reference(_)) => {
                TypeVal::Reference(JavaType::object())
            }
            _ => TypeVal::Bogus,
        })
    }

    fn caught_value(&mut self, _pos: u32, caught: &CaughtException) -> Result<TypeVal> {
        let name: Arc<str> = caught
            .class
            .clone()
            .unwrap_or_else(|| Arc::from("java/lang/Throwable"));
        Ok(TypeVal::Reference(JavaType::Object(name)))
    }

    fn constant(&mut self, _step: &mut Step<'_>, kind: &ConstKind) -> Result<TypeVal> {
        Ok(match kind {
            ConstKind::Null => TypeVal::Null,
            ConstKind::Int(_) => TypeVal::Int,
            ConstKind::Long(_) => TypeVal::Long,
            ConstKind::Float(_) => TypeVal::Float,
            ConstKind::Double(_) => TypeVal::Double,
            ConstKind::Str(_) => TypeVal::Reference(JavaType::Object(Arc::from("java/lang/String"))),
            ConstKind::Class(_) => {
                TypeVal::Reference(JavaType::Object(Arc::from("java/lang/Class")))
            }
            ConstKind::MethodHandle(_) => TypeVal::Reference(JavaType::Object(Arc::from(
                "java/lang/invoke/MethodHandle",
            ))),
            ConstKind::MethodType(_) => TypeVal::Reference(JavaType::Object(Arc::from(
                "java/lang/invoke/MethodType",
            ))),
        })
    }

    fn load(
        &mut self,
        step: &mut Step<'_>,
        ty: WordType,
        index: u16,
        value: &TypeVal,
    ) -> Result<TypeVal> {
        verify(step.pos(), !matches!(value, TypeVal::Bogus), || {
            format!("load from local {index} after an incompatible merge")
        })?;
        self.check_word(step.pos(), value, ty)?;
        Ok(value.clone())
    }

    fn store(
        &mut self,
        step: &mut Step<'_>,
        ty: WordType,
        _index: u16,
        value: TypeVal,
    ) -> Result<TypeVal> {
        self.check_word(step.pos(), &value, ty)?;
        Ok(value)
    }

    fn array_load(
        &mut self,
        step: &mut Step<'_>,
        elem: ElemType,
        array: TypeVal,
        index: TypeVal,
    ) -> Result<TypeVal> {
        self.check_word(step.pos(), &index, WordType::Int)?;
        match &array {
            TypeVal::Null => {}
            TypeVal::Reference(JavaType::Array(_)) => {}
            other => {
                return Err(Error::Verification {
                    message: format!("array load from {other:?}"),
                    pos: step.pos(),
                })
            }
        }
        Ok(match (&array, elem) {
            (TypeVal::Reference(JavaType::Array(inner)), ElemType::Reference) => {
                TypeVal::of(inner)
            }
            (_, ElemType::Reference) => TypeVal::Reference(JavaType::object()),
            (_, ElemType::Long) => TypeVal::Long,
            (_, ElemType::Float) => TypeVal::Float,
            (_, ElemType::Double) => TypeVal::Double,
            _ => TypeVal::Int,
        })
    }

    fn array_store(
        &mut self,
        step: &mut Step<'_>,
        elem: ElemType,
        array: TypeVal,
        index: TypeVal,
        value: TypeVal,
    ) -> Result<()> {
        self.check_word(step.pos(), &index, WordType::Int)?;
        match &array {
            TypeVal::Null | TypeVal::Reference(JavaType::Array(_)) => {}
            other => {
                return Err(Error::Verification {
                    message: format!("array store into {other:?}"),
                    pos: step.pos(),
                })
            }
        }
        let expected = match elem {
            ElemType::Reference => WordType::Reference,
            ElemType::Long => WordType::Long,
            ElemType::Float => WordType::Float,
            ElemType::Double => WordType::Double,
            _ => WordType::Int,
        };
        self.check_word(step.pos(), &value, expected)
    }

    fn binary(
        &mut self,
        step: &mut Step<'_>,
        _op: crate::analysis::BinOp,
        ty: NumType,
        lhs: TypeVal,
        rhs: TypeVal,
    ) -> Result<TypeVal> {
        self.check_num(step.pos(), &lhs, ty)?;
        // Shift distances arrive as int regardless of the operand type.
        if !rhs.matches_num(ty) {
            self.check_num(step.pos(), &rhs, NumType::Int)?;
        }
        Ok(Self::num_result(ty))
    }

    fn negate(&mut self, step: &mut Step<'_>, ty: NumType, value: TypeVal) -> Result<TypeVal> {
        self.check_num(step.pos(), &value, ty)?;
        Ok(Self::num_result(ty))
    }

    fn iinc(
        &mut self,
        step: &mut Step<'_>,
        _index: u16,
        _delta: i16,
        value: &TypeVal,
    ) -> Result<TypeVal> {
        self.check_word(step.pos(), value, WordType::Int)?;
        Ok(TypeVal::Int)
    }

    fn convert(&mut self, step: &mut Step<'_>, kind: ConvKind, value: TypeVal) -> Result<TypeVal> {
        self.check_num(step.pos(), &value, kind.from_ty())?;
        Ok(Self::num_result(kind.to_ty()))
    }

    fn compare(
        &mut self,
        step: &mut Step<'_>,
        kind: CmpKind,
        lhs: TypeVal,
        rhs: TypeVal,
    ) -> Result<TypeVal> {
        let ty = match kind {
            CmpKind::Long => NumType::Long,
            CmpKind::FloatL | CmpKind::FloatG => NumType::Float,
            CmpKind::DoubleL | CmpKind::DoubleG => NumType::Double,
        };
        self.check_num(step.pos(), &lhs, ty)?;
        self.check_num(step.pos(), &rhs, ty)?;
        Ok(TypeVal::Int)
    }

    fn branch(
        &mut self,
        step: &mut Step<'_>,
        kind: BranchKind,
        operands: &[TypeVal],
    ) -> Result<()> {
        match kind {
            BranchKind::IfZero(_) | BranchKind::IfICmp(_) => {
                for v in operands {
                    self.check_word(step.pos(), v, WordType::Int)?;
                }
            }
            BranchKind::IfACmp(_) | BranchKind::IfNull(_) => {
                for v in operands {
                    self.check_initialized_ref(step.pos(), v)?;
                }
            }
            BranchKind::Goto => {}
        }
        Ok(())
    }

    fn switch(&mut self, step: &mut Step<'_>, value: TypeVal) -> Result<()> {
        self.check_word(step.pos(), &value, WordType::Int)
    }

    fn return_value(
        &mut self,
        step: &mut Step<'_>,
        value: Option<(WordType, TypeVal)>,
    ) -> Result<()> {
        match (&self.return_type, value) {
            (None, None) => Ok(()),
            (Some(declared), Some((ty, v))) => {
                let expected = match TypeVal::of(declared) {
                    TypeVal::Int => WordType::Int,
                    TypeVal::Float => WordType::Float,
                    TypeVal::Long => WordType::Long,
                    TypeVal::Double => WordType::Double,
                    _ => WordType::Reference,
                };
                verify(step.pos(), expected == ty, || {
                    format!("return kind {ty:?} does not match declared {declared}")
                })?;
                self.check_word(step.pos(), &v, ty)
            }
            (declared, actual) => Err(Error::Verification {
                message: format!(
                    "return arity mismatch: declared {declared:?}, returned {:?}",
                    actual.map(|(ty, _)| ty)
                ),
                pos: step.pos(),
            }),
        }
    }

    fn throw(&mut self, step: &mut Step<'_>, value: TypeVal) -> Result<()> {
        self.check_initialized_ref(step.pos(), &value)
    }

    fn get_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<TypeVal>,
    ) -> Result<TypeVal> {
        if let Some(receiver) = receiver {
            self.check_initialized_ref(step.pos(), &receiver)?;
        }
        Ok(TypeVal::of(&field.descriptor))
    }

    fn put_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<TypeVal>,
        value: TypeVal,
    ) -> Result<()> {
        if let Some(receiver) = receiver {
            // Writes to the receiver's own fields are legal before super().
            verify(step.pos(), receiver.is_reference(), || {
                format!("field write through non-reference {receiver:?}")
            })?;
        }
        let expected = match TypeVal::of(&field.descriptor) {
            TypeVal::Int => WordType::Int,
            TypeVal::Float => WordType::Float,
            TypeVal::Long => WordType::Long,
            TypeVal::Double => WordType::Double,
            _ => WordType::Reference,
        };
        self.check_word(step.pos(), &value, expected)
    }

    fn invoke(
        &mut self,
        step: &mut Step<'_>,
        kind: InvokeKind,
        method: &MethodRef,
        args: Vec<TypeVal>,
    ) -> Result<InvokeOutcome<TypeVal>> {
        let pos = step.pos();
        let mut params = args.iter();
        let mut replace_all = None;
        if kind.has_receiver() {
            let receiver = params.next().ok_or_else(|| Error::Verification {
                message: "instance call without receiver".into(),
                pos,
            })?;
            if kind == InvokeKind::Special && method.is_constructor() {
                let initialized = match receiver {
                    TypeVal::Uninit { class, .. } => {
                        TypeVal::Reference(JavaType::Object(class.name.clone()))
                    }
                    TypeVal::UninitThis(class) => {
                        TypeVal::Reference(JavaType::Object(class.name.clone()))
                    }
                    other => {
                        return Err(Error::Verification {
                            message: format!("constructor call on initialized {other:?}"),
                            pos,
                        })
                    }
                };
                replace_all = Some((receiver.clone(), initialized));
            } else {
                self.check_initialized_ref(pos, receiver)?;
            }
        }
        for (declared, actual) in method.descriptor.params.iter().zip(params) {
            let expected = match TypeVal::of(declared) {
                TypeVal::Int => WordType::Int,
                TypeVal::Float => WordType::Float,
                TypeVal::Long => WordType::Long,
                TypeVal::Double => WordType::Double,
                _ => WordType::Reference,
            };
            self.check_word(pos, actual, expected)?;
        }
        let result = method.descriptor.ret.as_ref().map(TypeVal::of);
        Ok(InvokeOutcome {
            result,
            replace_all,
        })
    }

    fn invoke_dynamic(
        &mut self,
        _step: &mut Step<'_>,
        site: &CallSiteRef,
        _args: Vec<TypeVal>,
    ) -> Result<Option<TypeVal>> {
        Ok(site.descriptor.ret.as_ref().map(TypeVal::of))
    }

    fn new_object(&mut self, step: &mut Step<'_>, class: &ClassRef) -> Result<TypeVal> {
        Ok(TypeVal::Uninit {
            at: step.pos(),
            class: class.clone(),
        })
    }

    fn new_array(
        &mut self,
        step: &mut Step<'_>,
        array_ty: &JavaType,
        counts: Vec<TypeVal>,
    ) -> Result<TypeVal> {
        for count in &counts {
            self.check_word(step.pos(), count, WordType::Int)?;
        }
        Ok(TypeVal::Reference(array_ty.clone()))
    }

    fn array_length(&mut self, step: &mut Step<'_>, array: TypeVal) -> Result<TypeVal> {
        match array {
            TypeVal::Null | TypeVal::Reference(JavaType::Array(_)) => Ok(TypeVal::Int),
            other => Err(Error::Verification {
                message: format!("arraylength on {other:?}"),
                pos: step.pos(),
            }),
        }
    }

    fn check_cast(
        &mut self,
        step: &mut Step<'_>,
        class: &ClassRef,
        value: TypeVal,
    ) -> Result<TypeVal> {
        self.check_initialized_ref(step.pos(), &value)?;
        let target = if class.name.starts_with('[') {
            JavaType::parse(&class.name)?
        } else {
            JavaType::Object(class.name.clone())
        };
        Ok(TypeVal::Reference(target))
    }

    fn instance_of(
        &mut self,
        step: &mut Step<'_>,
        _class: &ClassRef,
        value: TypeVal,
    ) -> Result<TypeVal> {
        self.check_initialized_ref(step.pos(), &value)?;
        Ok(TypeVal::Int)
    }

    fn monitor(&mut self, step: &mut Step<'_>, _op: MonitorOp, value: TypeVal) -> Result<()> {
        self.check_initialized_ref(step.pos(), &value)
    }
}

/// The completed type analysis of one method.
pub struct TypeAnalysis {
    analyzer: Analyzer<FrameDomain<TypeSemantics>>,
}

impl TypeAnalysis {
    /// Runs the type pass over `body`.
    ///
    /// # Errors
    ///
    /// Propagates verification and flow-construction failures.
    pub fn run(body: &MethodBody) -> Result<Self> {
        let mut analyzer = Analyzer::new(body)?;
        let mut domain = FrameDomain::new(TypeSemantics { return_type: None });
        analyzer.run(body, &mut domain)?;
        Ok(TypeAnalysis { analyzer })
    }

    /// The underlying analyzer, for constructing child analyses that share
    /// the control flow.
    #[must_use]
    pub fn analyzer(&self) -> &Analyzer<FrameDomain<TypeSemantics>> {
        &self.analyzer
    }

    /// Frame of slot types flowing *into* `pos`.
    #[must_use]
    pub fn frame_at(&self, pos: u32) -> Option<&Frame<TypeVal>> {
        self.analyzer.in_state(pos)
    }

    /// Type of the stack slot `depth` below the top just before `pos`.
    #[must_use]
    pub fn stack_type(&self, pos: u32, depth: u16) -> Option<&TypeVal> {
        self.frame_at(pos)?.peek(depth).ok()?.value()
    }

    /// Type of local `index` just before `pos`.
    #[must_use]
    pub fn local_type(&self, pos: u32, index: u16) -> Option<&TypeVal> {
        self.frame_at(pos)?.local(index).ok()?.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{opcode as op, MethodBuilder, MethodFlags};

    #[test]
    fn infers_slot_types() {
        let body = MethodBuilder::new("t/T", "f", "(IJ)J", MethodFlags::STATIC)
            .unwrap()
            .local_op(op::LLOAD, 1)
            .local_op(op::ILOAD, 0)
            .op(op::I2L)
            .op(op::LADD)
            .op(op::LRETURN)
            .build()
            .unwrap();
        let types = TypeAnalysis::run(&body).unwrap();
        assert_eq!(types.local_type(0, 0), Some(&TypeVal::Int));
        assert_eq!(types.local_type(0, 1), Some(&TypeVal::Long));
        // Before ladd: two longs on the stack, each with its sentinel on
        // top, so the values sit at depths 1 and 3.
        let ladd_pos = 5;
        assert_eq!(types.stack_type(ladd_pos, 1), Some(&TypeVal::Long));
        assert_eq!(types.stack_type(ladd_pos, 3), Some(&TypeVal::Long));
    }

    #[test]
    fn rejects_type_confusion() {
        // fload of an int parameter.
        let body = MethodBuilder::new("t/T", "f", "(I)F", MethodFlags::STATIC)
            .unwrap()
            .local_op(op::FLOAD, 0)
            .op(op::FRETURN)
            .build()
            .unwrap();
        assert!(matches!(
            TypeAnalysis::run(&body),
            Err(Error::Verification { .. })
        ));
    }

    #[test]
    fn rejects_wrong_return_kind() {
        let body = MethodBuilder::new("t/T", "f", "(I)J", MethodFlags::STATIC)
            .unwrap()
            .local_op(op::ILOAD, 0)
            .op(op::IRETURN)
            .build()
            .unwrap();
        assert!(matches!(
            TypeAnalysis::run(&body),
            Err(Error::Verification { .. })
        ));
    }

    #[test]
    fn merges_distinct_references_to_object() {
        let mut b = MethodBuilder::new("t/T", "f", "(Z)Ljava/lang/Object;", MethodFlags::STATIC)
            .unwrap();
        let other = b.label();
        let join = b.label();
        let body = b
            .local_op(op::ILOAD, 0)
            .branch(op::IFEQ, other)
            .pool_op(
                op::LDC,
                crate::bytecode::PoolEntry::Str(Arc::from("left")),
            )
            .branch(op::GOTO, join)
            .bind(other)
            .pool_op(
                op::LDC,
                crate::bytecode::PoolEntry::Class(ClassRef::new("t/Other")),
            )
            .bind(join)
            .op(op::ARETURN)
            .build()
            .unwrap();
        let types = TypeAnalysis::run(&body).unwrap();
        let insns = body.decode().unwrap();
        let areturn = insns.last().unwrap().offset;
        // String against Class falls back to the Object model.
        assert_eq!(
            types.stack_type(areturn, 0),
            Some(&TypeVal::Reference(JavaType::object()))
        );
    }

    #[test]
    fn null_merge_keeps_the_reference_type() {
        let mut b = MethodBuilder::new("t/T", "f", "(Z)Ljava/lang/Object;", MethodFlags::STATIC)
            .unwrap();
        let other = b.label();
        let join = b.label();
        let body = b
            .local_op(op::ILOAD, 0)
            .branch(op::IFEQ, other)
            .pool_op(
                op::LDC,
                crate::bytecode::PoolEntry::Str(Arc::from("left")),
            )
            .branch(op::GOTO, join)
            .bind(other)
            .op(op::ACONST_NULL)
            .bind(join)
            .op(op::ARETURN)
            .build()
            .unwrap();
        let types = TypeAnalysis::run(&body).unwrap();
        let insns = body.decode().unwrap();
        let areturn = insns.last().unwrap().offset;
        assert_eq!(
            types.stack_type(areturn, 0),
            Some(&TypeVal::Reference(JavaType::Object(Arc::from(
                "java/lang/String"
            ))))
        );
    }
}

//! Decomposition of boxing/unboxing wrapper calls into synthetic steps.
//!
//! [`Boxed`] wraps any [`Semantics`] and rewrites invocations of the pure
//! numeric wrapper methods (`Integer.valueOf`, `longValue`, and friends)
//! into the synthetic [`Semantics::box_value`]/[`Semantics::unbox_value`]
//! operations, so the passes built on it reason about autoboxing with the
//! same vocabulary as primitive conversions.
//!
//! The decomposition runs as two transfers through the same position: the
//! first pops the operands and suppresses successor re-enqueuing, the second
//! applies the synthetic step and pushes the result. The engine stores a
//! single in/out state pair for the position either way.
//!
//! The base type analysis runs *without* this wrapper: for verification
//! purposes a wrapper call is an ordinary invocation.

use crate::{
    analysis::{
        dispatch::{InvokeKind, InvokeOutcome, Semantics},
        engine::Step,
        frame::Frame,
    },
    bytecode::{BaseType, MethodBody, MethodRef},
    Error, Result,
};

/// A recognized wrapper operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapperCall {
    Box(BaseType),
    Unbox(BaseType),
}

/// Matches `java/lang/<Wrapper>` to the primitive it boxes.
fn wrapper_primitive(class: &str) -> Option<BaseType> {
    Some(match class {
        "java/lang/Integer" => BaseType::Int,
        "java/lang/Long" => BaseType::Long,
        "java/lang/Float" => BaseType::Float,
        "java/lang/Double" => BaseType::Double,
        "java/lang/Short" => BaseType::Short,
        "java/lang/Byte" => BaseType::Byte,
        "java/lang/Character" => BaseType::Char,
        "java/lang/Boolean" => BaseType::Boolean,
        _ => return None,
    })
}

fn unbox_method_name(prim: BaseType) -> &'static str {
    match prim {
        BaseType::Int => "intValue",
        BaseType::Long => "longValue",
        BaseType::Float => "floatValue",
        BaseType::Double => "doubleValue",
        BaseType::Short => "shortValue",
        BaseType::Byte => "byteValue",
        BaseType::Char => "charValue",
        BaseType::Boolean => "booleanValue",
    }
}

/// Classifies a call as a pure boxing/unboxing wrapper operation.
fn classify(kind: InvokeKind, method: &MethodRef) -> Option<WrapperCall> {
    let prim = wrapper_primitive(&method.class.name)?;
    match kind {
        InvokeKind::Static if &*method.name == "valueOf" => {
            // valueOf(P)Ljava/lang/Wrapper;
            let d = &method.descriptor;
            let matches_shape = d.params.len() == 1
                && d.params[0] == crate::bytecode::JavaType::Base(prim)
                && d.ret
                    .as_ref()
                    .is_some_and(|r| matches!(r, crate::bytecode::JavaType::Object(n) if **n == *method.class.name));
            matches_shape.then_some(WrapperCall::Box(prim))
        }
        InvokeKind::Virtual if &*method.name == unbox_method_name(prim) => {
            let d = &method.descriptor;
            let matches_shape = d.params.is_empty()
                && d.ret.as_ref() == Some(&crate::bytecode::JavaType::Base(prim));
            matches_shape.then_some(WrapperCall::Unbox(prim))
        }
        _ => None,
    }
}

/// Pending synthetic step carried between the two transfers of a position.
#[derive(Debug)]
struct PendingStep<V> {
    pos: u32,
    call: WrapperCall,
    operand: V,
}

/// Semantics wrapper performing boxing/unboxing decomposition.
pub struct Boxed<S: Semantics> {
    inner: S,
    pending: Option<PendingStep<S::Value>>,
}

impl<S: Semantics> Boxed<S> {
    /// Wraps an inner semantics implementation.
    pub fn new(inner: S) -> Self {
        Boxed {
            inner,
            pending: None,
        }
    }

    /// Unwraps the inner semantics.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Read access to the inner semantics.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Semantics> Semantics for Boxed<S> {
    type Value = S::Value;

    fn entry_frame(&mut self, body: &MethodBody) -> Result<Frame<Self::Value>> {
        self.inner.entry_frame(body)
    }

    fn merge_values(&mut self, pos: u32, a: &Self::Value, b: &Self::Value) -> Result<Self::Value> {
        self.inner.merge_values(pos, a, b)
    }

    fn caught_value(
        &mut self,
        pos: u32,
        caught: &crate::analysis::CaughtException,
    ) -> Result<Self::Value> {
        self.inner.caught_value(pos, caught)
    }

    fn constant(
        &mut self,
        step: &mut Step<'_>,
        kind: &crate::analysis::ConstKind,
    ) -> Result<Self::Value> {
        self.inner.constant(step, kind)
    }

    fn load(
        &mut self,
        step: &mut Step<'_>,
        ty: crate::analysis::WordType,
        index: u16,
        value: &Self::Value,
    ) -> Result<Self::Value> {
        self.inner.load(step, ty, index, value)
    }

    fn store(
        &mut self,
        step: &mut Step<'_>,
        ty: crate::analysis::WordType,
        index: u16,
        value: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.store(step, ty, index, value)
    }

    fn array_load(
        &mut self,
        step: &mut Step<'_>,
        elem: crate::analysis::ElemType,
        array: Self::Value,
        index: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.array_load(step, elem, array, index)
    }

    fn array_store(
        &mut self,
        step: &mut Step<'_>,
        elem: crate::analysis::ElemType,
        array: Self::Value,
        index: Self::Value,
        value: Self::Value,
    ) -> Result<()> {
        self.inner.array_store(step, elem, array, index, value)
    }

    fn binary(
        &mut self,
        step: &mut Step<'_>,
        op: crate::analysis::BinOp,
        ty: crate::analysis::NumType,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.binary(step, op, ty, lhs, rhs)
    }

    fn negate(
        &mut self,
        step: &mut Step<'_>,
        ty: crate::analysis::NumType,
        value: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.negate(step, ty, value)
    }

    fn iinc(
        &mut self,
        step: &mut Step<'_>,
        index: u16,
        delta: i16,
        value: &Self::Value,
    ) -> Result<Self::Value> {
        self.inner.iinc(step, index, delta, value)
    }

    fn convert(
        &mut self,
        step: &mut Step<'_>,
        kind: crate::analysis::ConvKind,
        value: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.convert(step, kind, value)
    }

    fn compare(
        &mut self,
        step: &mut Step<'_>,
        kind: crate::analysis::CmpKind,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.compare(step, kind, lhs, rhs)
    }

    fn branch(
        &mut self,
        step: &mut Step<'_>,
        kind: crate::analysis::BranchKind,
        operands: &[Self::Value],
    ) -> Result<()> {
        self.inner.branch(step, kind, operands)
    }

    fn switch(&mut self, step: &mut Step<'_>, value: Self::Value) -> Result<()> {
        self.inner.switch(step, value)
    }

    fn return_value(
        &mut self,
        step: &mut Step<'_>,
        value: Option<(crate::analysis::WordType, Self::Value)>,
    ) -> Result<()> {
        self.inner.return_value(step, value)
    }

    fn throw(&mut self, step: &mut Step<'_>, value: Self::Value) -> Result<()> {
        self.inner.throw(step, value)
    }

    fn get_field(
        &mut self,
        step: &mut Step<'_>,
        field: &crate::bytecode::FieldRef,
        receiver: Option<Self::Value>,
    ) -> Result<Self::Value> {
        self.inner.get_field(step, field, receiver)
    }

    fn put_field(
        &mut self,
        step: &mut Step<'_>,
        field: &crate::bytecode::FieldRef,
        receiver: Option<Self::Value>,
        value: Self::Value,
    ) -> Result<()> {
        self.inner.put_field(step, field, receiver, value)
    }

    fn invoke(
        &mut self,
        step: &mut Step<'_>,
        kind: InvokeKind,
        method: &MethodRef,
        args: Vec<Self::Value>,
    ) -> Result<InvokeOutcome<Self::Value>> {
        if let Some(call) = classify(kind, method) {
            let operand = args.into_iter().next().ok_or_else(|| {
                Error::Internal("wrapper call dispatched without operand".into())
            })?;
            self.pending = Some(PendingStep {
                pos: step.pos(),
                call,
                operand,
            });
            step.resume();
            step.suppress_all_successors();
            // Nothing is pushed yet; the synthetic step completes the stack
            // effect on the second transfer.
            return Ok(InvokeOutcome::returning(None));
        }
        self.inner.invoke(step, kind, method, args)
    }

    fn invoke_dynamic(
        &mut self,
        step: &mut Step<'_>,
        site: &crate::bytecode::CallSiteRef,
        args: Vec<Self::Value>,
    ) -> Result<Option<Self::Value>> {
        self.inner.invoke_dynamic(step, site, args)
    }

    fn new_object(
        &mut self,
        step: &mut Step<'_>,
        class: &crate::bytecode::ClassRef,
    ) -> Result<Self::Value> {
        self.inner.new_object(step, class)
    }

    fn new_array(
        &mut self,
        step: &mut Step<'_>,
        elem: &crate::bytecode::JavaType,
        counts: Vec<Self::Value>,
    ) -> Result<Self::Value> {
        self.inner.new_array(step, elem, counts)
    }

    fn array_length(&mut self, step: &mut Step<'_>, array: Self::Value) -> Result<Self::Value> {
        self.inner.array_length(step, array)
    }

    fn check_cast(
        &mut self,
        step: &mut Step<'_>,
        class: &crate::bytecode::ClassRef,
        value: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.check_cast(step, class, value)
    }

    fn instance_of(
        &mut self,
        step: &mut Step<'_>,
        class: &crate::bytecode::ClassRef,
        value: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.instance_of(step, class, value)
    }

    fn monitor(
        &mut self,
        step: &mut Step<'_>,
        op: crate::analysis::MonitorOp,
        value: Self::Value,
    ) -> Result<()> {
        self.inner.monitor(step, op, value)
    }

    fn box_value(
        &mut self,
        step: &mut Step<'_>,
        prim: BaseType,
        value: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.box_value(step, prim, value)
    }

    fn unbox_value(
        &mut self,
        step: &mut Step<'_>,
        prim: BaseType,
        value: Self::Value,
    ) -> Result<Self::Value> {
        self.inner.unbox_value(step, prim, value)
    }

    fn exit(&mut self, pos: u32, frame: &Frame<Self::Value>) -> Result<()> {
        self.inner.exit(pos, frame)
    }

    fn continue_step(
        &mut self,
        step: &mut Step<'_>,
        frame: &mut Frame<Self::Value>,
    ) -> Result<bool> {
        let Some(pending) = self.pending.take() else {
            return self.inner.continue_step(step, frame);
        };
        if pending.pos != step.pos() {
            return Err(Error::Internal(format!(
                "pending boxing step at {} resumed at {}",
                pending.pos,
                step.pos()
            )));
        }
        match pending.call {
            WrapperCall::Box(prim) => {
                let boxed = self.inner.box_value(step, prim, pending.operand)?;
                frame.push(boxed)?;
            }
            WrapperCall::Unbox(prim) => {
                let unboxed = self.inner.unbox_value(step, prim, pending.operand)?;
                if prim.is_wide() {
                    frame.push2(unboxed)?;
                } else {
                    frame.push(unboxed)?;
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ClassRef, MethodDescriptor};
    use std::sync::Arc;

    fn method(class: &str, name: &str, descriptor: &str) -> MethodRef {
        MethodRef {
            class: ClassRef::new(class),
            name: Arc::from(name),
            descriptor: MethodDescriptor::parse(descriptor).unwrap(),
        }
    }

    #[test]
    fn recognizes_value_of_and_xxx_value() {
        assert_eq!(
            classify(
                InvokeKind::Static,
                &method("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;")
            ),
            Some(WrapperCall::Box(BaseType::Int))
        );
        assert_eq!(
            classify(InvokeKind::Virtual, &method("java/lang/Long", "longValue", "()J")),
            Some(WrapperCall::Unbox(BaseType::Long))
        );
    }

    #[test]
    fn ignores_other_members_of_wrapper_classes() {
        assert_eq!(
            classify(
                InvokeKind::Static,
                &method("java/lang/Integer", "parseInt", "(Ljava/lang/String;)I")
            ),
            None
        );
        // valueOf(String) is not a pure boxing call.
        assert_eq!(
            classify(
                InvokeKind::Static,
                &method(
                    "java/lang/Integer",
                    "valueOf",
                    "(Ljava/lang/String;)Ljava/lang/Integer;"
                )
            ),
            None
        );
        assert_eq!(
            classify(InvokeKind::Virtual, &method("demo/Num", "intValue", "()I")),
            None
        );
    }
}

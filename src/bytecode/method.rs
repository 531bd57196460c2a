//! Method body representation: the unit of analysis and transformation.
//!
//! A [`MethodBody`] bundles everything one weaving run needs: the raw code
//! array, the exception handler table, the resolved constant pool, the
//! declared descriptor and flags, and the `max_stack`/`max_locals` metadata
//! that the weave phase recomputes after editing.
//!
//! Bodies are immutable inputs; the weave phase produces a fresh body rather
//! than mutating in place, so a failed analysis can always fall back to the
//! original bytes.

use std::sync::Arc;

use bitflags::bitflags;

use crate::{
    bytecode::{
        decoder,
        descriptor::MethodDescriptor,
        instruction::Instruction,
        pool::{ConstPool, MemberId},
    },
    Result,
};

bitflags! {
    /// Method access flags, restricted to the bits the analyses consume.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u16 {
        /// `ACC_STATIC` - no receiver slot.
        const STATIC = 0x0008;
        /// `ACC_FINAL`.
        const FINAL = 0x0010;
        /// `ACC_SYNCHRONIZED`.
        const SYNCHRONIZED = 0x0020;
    }
}

/// One entry of a method's exception handler table.
///
/// Offsets follow class-file conventions: the protected range is
/// `[start, end)` and `handler` is the first instruction of the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    /// Start of the protected range (inclusive).
    pub start: u32,
    /// End of the protected range (exclusive).
    pub end: u32,
    /// Handler entry offset.
    pub handler: u32,
    /// Internal name of the caught class, or `None` for catch-all clauses.
    pub catch_type: Option<Arc<str>>,
}

/// An immutable method body handed to the weaving pipeline.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// Internal name of the declaring class.
    pub class: Arc<str>,
    /// Method name.
    pub name: Arc<str>,
    /// Parsed method descriptor.
    pub descriptor: MethodDescriptor,
    /// Access flags.
    pub flags: MethodFlags,
    /// Declared operand stack depth limit.
    pub max_stack: u16,
    /// Declared local variable slot count.
    pub max_locals: u16,
    /// Raw code array.
    pub code: Vec<u8>,
    /// Exception handler table, in declaration order.
    pub handlers: Vec<ExceptionHandler>,
    /// Resolved constant pool of the declaring class.
    pub pool: Arc<ConstPool>,
}

impl MethodBody {
    /// Returns `true` if the method has no receiver slot.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Returns `true` if this body is an instance initializer.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        &*self.name == "<init>"
    }

    /// Stable identifier of this method, used as the suppression context for
    /// staging policy lookups.
    #[must_use]
    pub fn member_id(&self) -> MemberId {
        MemberId::new(
            self.class.clone(),
            self.name.clone(),
            self.descriptor.to_string(),
        )
    }

    /// Decodes the code array into an instruction stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadCode`](crate::Error::BadCode) if the code array is
    /// malformed.
    pub fn decode(&self) -> Result<Vec<Instruction>> {
        decoder::decode_stream(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode as op;

    #[test]
    fn member_id_uses_descriptor_string() {
        let body = MethodBody {
            class: Arc::from("demo/Calc"),
            name: Arc::from("f"),
            descriptor: MethodDescriptor::parse("(I)I").unwrap(),
            flags: MethodFlags::STATIC,
            max_stack: 2,
            max_locals: 1,
            code: vec![op::ILOAD_0, op::ICONST_1, op::IADD, op::IRETURN],
            handlers: Vec::new(),
            pool: Arc::new(ConstPool::new()),
        };
        assert!(body.is_static());
        assert!(!body.is_constructor());
        assert_eq!(body.member_id().to_string(), "demo/Calc.f:(I)I");
        assert_eq!(body.decode().unwrap().len(), 4);
    }
}

//! Method-body model: instructions, constant pool, descriptors, codecs.
//!
//! Everything the analyses consume about a method lives here: the decoded
//! instruction stream ([`Instruction`]), the resolved constant pool
//! ([`ConstPool`]) with typed symbolic references, descriptor parsing
//! ([`JavaType`], [`MethodDescriptor`]), the [`MethodBody`] container, and
//! the byte-level codecs ([`decode_stream`], [`assemble`]) plus the
//! label-based [`MethodBuilder`].

mod builder;
mod decoder;
mod descriptor;
mod encoder;
mod instruction;
mod method;
pub mod opcode;
mod pool;

pub use builder::{Label, MethodBuilder};
pub use decoder::decode_stream;
pub use descriptor::{BaseType, JavaType, MethodDescriptor};
pub use encoder::assemble;
pub use instruction::{FlowKind, Instruction, Operand};
pub use method::{ExceptionHandler, MethodBody, MethodFlags};
pub use pool::{
    BootstrapArg, CallSiteRef, ClassRef, ConstPool, FieldFlags, FieldRef, HandleKind, MemberId,
    MethodHandleRef, MethodRef, PoolEntry,
};

//! Convenient re-exports of the most commonly used byteloom types.
//!
//! Import everything a typical weaving setup needs with one line:
//!
//! ```rust
//! use byteloom::prelude::*;
//! ```

pub use crate::{
    analysis::{ConstantAnalysis, TypeAnalysis, ValueFlowAnalysis},
    bytecode::{
        opcode, ConstPool, ExceptionHandler, FieldRef, Instruction, JavaType, MemberId,
        MethodBody, MethodBuilder, MethodDescriptor, MethodFlags, MethodRef, PoolEntry,
    },
    stage::{
        build_stage_graph, Cachability, CachedPolicy, Language, StageGraph, StageInfo,
        StagePolicy, TablePolicy,
    },
    weave::{EditPlan, NullEmitter, RuntimeSurface, SiteEmitter, WeaveType},
    Error, Result, WeaveConfig, WeaveOutcome, Weaver, WovenBody,
};

//! The abstract-interpretation framework and the base analyses.
//!
//! The reusable core is layered bottom-up:
//!
//! - [`Frame`] - one stack-machine snapshot, generic over the slot value
//! - [`ControlFlow`] - per-method edges, exception routing and priorities,
//!   built once and shared read-only by every pass over that method
//! - [`Analyzer`] - the fixed-point worklist driver over a [`Domain`]
//! - [`Semantics`] / [`FrameDomain`] - the instruction decoder layer mapping
//!   every opcode onto a flat semantic vocabulary
//! - [`Boxed`] - boxing/unboxing decomposition on top of any semantics
//!
//! On that framework sit the three base passes consumed by the staging
//! layers: [`TypeAnalysis`], [`ValueFlowAnalysis`] and [`ConstantAnalysis`].

mod boxing;
mod constflow;
mod dispatch;
mod engine;
mod flow;
mod frame;
mod typeflow;
mod valueflow;

pub use boxing::Boxed;
pub use constflow::{Constant, ConstantAnalysis, ConstOperand, ConstVal};
pub use dispatch::{
    transfer_frame, BinOp, BranchKind, CmpKind, Cond, ConstKind, ConvKind, ElemType, FrameDomain,
    InvokeKind, InvokeOutcome, MonitorOp, NumType, Semantics, WordType,
};
pub use engine::{Analyzer, AnalyzerState, Domain, Step};
pub use flow::{CaughtException, ControlFlow};
pub use frame::{Frame, Slot};
pub use typeflow::{TypeAnalysis, TypeSemantics, TypeVal};
pub use valueflow::{
    InitStatus, SourceId, SourceIndex, SourceSet, SourceTable, TrackedValue, UseIndex,
    ValueFlowAnalysis,
};

// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # byteloom
//!
//! [![Crates.io](https://img.shields.io/crates/v/byteloom.svg)](https://crates.io/crates/byteloom)
//! [![Documentation](https://docs.rs/byteloom/badge.svg)](https://docs.rs/byteloom)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/byteloom/blob/main/LICENSE)
//!
//! A load-time JVM bytecode weaver. `byteloom` analyzes one method body at a
//! time with a family of abstract-interpretation passes and rewrites *staged*
//! (annotated) field and method accesses to route through a lazy
//! expression-tree runtime instead of executing eagerly.
//!
//! ## Features
//!
//! - **🔁 Reusable abstract interpretation** - A fixed-point worklist engine
//!   over a shared control-flow graph with exception edges, generic over the
//!   abstract value domain
//! - **🧮 Layered analyses** - Type, value-flow and constant passes that each
//!   instantiate the engine with a different domain and consume each other's
//!   results
//! - **🕸️ Stage graphs** - A two-pass construction of control and data edges
//!   restricted to the nodes that matter for staging
//! - **🪡 Bytecode weaving** - A decision pass over a carrier-type lattice
//!   that emits an ordered, deduplicated edit plan and applies it with full
//!   branch, switch and exception-table fixup
//! - **🛡️ Fail-safe by design** - Any analysis failure leaves the method
//!   byte-identical to its input; only internal consistency violations
//!   surface to the caller
//!
//! ## Quick Start
//!
//! Add `byteloom` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! byteloom = "0.1"
//! ```
//!
//! ### Using the Prelude
//!
//! ```rust
//! use byteloom::prelude::*;
//!
//! // Nothing is staged under an empty policy, so the weaver leaves the
//! // method untouched.
//! let body = MethodBuilder::new("demo/Calc", "f", "(I)I", MethodFlags::STATIC)?
//!     .op(opcode::ILOAD_0)
//!     .op(opcode::ICONST_1)
//!     .op(opcode::IADD)
//!     .op(opcode::IRETURN)
//!     .build()?;
//!
//! let mut weaver = Weaver::new(TablePolicy::new(), NullEmitter, WeaveConfig::default());
//! assert!(matches!(weaver.weave(&body)?, WeaveOutcome::Unchanged));
//! # Ok::<(), byteloom::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `byteloom` is organized into a strict bottom-up dependency chain:
//!
//! - [`bytecode`] - Method-body model: instructions, constant pool,
//!   descriptors, codecs and the [`bytecode::MethodBuilder`]
//! - [`analysis`] - The abstract-interpretation framework
//!   ([`analysis::Frame`], [`analysis::ControlFlow`], [`analysis::Analyzer`],
//!   the [`analysis::Semantics`] dispatch layer) and the type, value-flow and
//!   constant passes
//! - [`stage`] - The staging-policy boundary and the stage-graph
//!   construction
//! - [`weave`] - The carrier lattice, the code-generation-decision pass, and
//!   edit-plan application
//! - [`Weaver`] - The per-method pipeline driver tying the passes together
//!
//! Every pass over one method shares a single control-flow graph built once;
//! child analyzers reuse the parent's arrays without recomputation. The
//! pipeline is single-threaded and processes one method body at a time.

#[macro_use]
mod error;

/// Common imports for working with byteloom.
///
/// This module re-exports the types an embedder touches in a typical weaving
/// setup: the method-body model, the pipeline driver and its configuration,
/// and the staging-policy surface.
///
/// # Example
///
/// ```rust
/// use byteloom::prelude::*;
///
/// let policy = TablePolicy::new();
/// let weaver = Weaver::new(policy, NullEmitter, WeaveConfig::default());
/// # let _ = weaver;
/// ```
pub mod prelude;

/// Method-body model: instructions, constant pool, descriptors, codecs.
///
/// Everything the analyses consume about a method lives here. The main
/// types:
///
/// - [`bytecode::MethodBody`] - The immutable unit of analysis
/// - [`bytecode::Instruction`] / [`bytecode::Operand`] - Decoded instructions
/// - [`bytecode::ConstPool`] - Resolved symbolic references
/// - [`bytecode::MethodBuilder`] - Label-based programmatic construction
pub mod bytecode;

/// The abstract-interpretation framework and the base analyses.
///
/// The reusable core ([`analysis::Frame`], [`analysis::ControlFlow`],
/// [`analysis::Analyzer`], [`analysis::Semantics`]) plus the three passes the
/// staging layers consume: [`analysis::TypeAnalysis`],
/// [`analysis::ValueFlowAnalysis`] and [`analysis::ConstantAnalysis`].
pub mod analysis;

/// Staging policy boundary and stage-graph construction.
///
/// [`stage::StagePolicy`] is the external annotation lookup;
/// [`stage::build_stage_graph`] runs the two-pass discovery and control-edge
/// registration that produces a [`stage::StageGraph`] for the weave phase.
pub mod stage;

/// The weaving phase: carrier lattice, edit planning and application.
///
/// [`weave::WeaveAnalysis`] decides per program point whether values must be
/// lifted into the lazy representation or materialized back, producing an
/// ordered [`weave::EditPlan`] that [`weave::apply_plan`] splices into the
/// instruction stream.
pub mod weave;

mod pipeline;

/// The generic Result type for all methods of this crate that can fail.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;
pub use pipeline::{WeaveConfig, WeaveOutcome, Weaver, WovenBody};

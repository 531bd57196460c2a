//! The weaving phase: carrier lattice, edit planning and application.
//!
//! This is where analysis turns into code. [`WeaveAnalysis`] walks the
//! method one final time over the [`WeaveType`] lattice and decides, per
//! program point, whether values must be *lifted* into the lazy carrier
//! representation, *materialized* back into concrete values, or left alone;
//! staged sites rewrite into calls to generated entry points, wrapped per
//! their caching strategy. The decisions come out as an ordered,
//! deduplicated [`EditPlan`] that [`apply_plan`] splices into the
//! instruction stream, remapping branches, switches and the exception table
//! and recomputing the stack and local budgets.
//!
//! The runtime the rewritten code calls into and the service generating the
//! per-site entry points stay behind [`RuntimeSurface`] and [`SiteEmitter`].

mod analysis;
mod apply;
mod carrier;
mod plan;
mod runtime;

pub use analysis::WeaveAnalysis;
pub use apply::apply_plan;
pub use carrier::WeaveType;
pub use plan::{Edit, EditKind, EditPlan};
pub use runtime::{NullEmitter, RuntimeSurface, SiteEmitter, StagedSiteDesc};

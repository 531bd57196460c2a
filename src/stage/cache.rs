//! Cachability planning for staged sites.
//!
//! The cachability *decision* is external ([`StagePolicy::cachability`]);
//! this module turns it into the concrete artifacts the weave phase splices
//! in: one synthetic static holder field per permanently-cacheable site, and
//! the set of merge positions whose path ambiguity must be recorded at run
//! time for trace-cacheable sites. Every staged site also receives a small
//! stable id the rewritten bytecode passes to the runtime cache calls.

use rustc_hash::FxHashMap;

use crate::{
    analysis::{SourceId, SourceIndex, ValueFlowAnalysis},
    bytecode::{ClassRef, FieldFlags, FieldRef, JavaType, MethodBody},
    stage::{graph::StageGraph, policy::Cachability, policy::StagePolicy},
};

/// How one staged site is cached at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheStrategy {
    /// One static holder field on the declaring class, reused forever.
    Permanent {
        /// The synthetic holder field.
        holder: FieldRef,
    },
    /// Bounded runtime cache keyed by the path trace through the listed
    /// merge positions.
    Trace {
        /// Positions whose merge ambiguity feeds this site's arguments.
        points: Vec<u32>,
    },
    /// Always recompute.
    None,
}

/// The assembled caching plan of one method.
#[derive(Debug, Default)]
pub struct CachePlan {
    strategies: FxHashMap<SourceId, CacheStrategy>,
    site_ids: FxHashMap<SourceId, u32>,
    trace_points: Vec<u32>,
    holders: Vec<FieldRef>,
    trace_depth: u16,
}

impl CachePlan {
    /// Strategy for a staged source; ordinary sources are never cached.
    #[must_use]
    pub fn strategy(&self, source: SourceId) -> &CacheStrategy {
        self.strategies.get(&source).unwrap_or(&CacheStrategy::None)
    }

    /// Stable per-method id of a staged site, passed to the runtime cache
    /// calls.
    #[must_use]
    pub fn site_id(&self, source: SourceId) -> Option<u32> {
        self.site_ids.get(&source).copied()
    }

    /// All merge positions that need a trace-record instruction, sorted and
    /// deduplicated.
    #[must_use]
    pub fn trace_points(&self) -> &[u32] {
        &self.trace_points
    }

    /// The synthetic holder fields the class gains, in site-id order.
    #[must_use]
    pub fn holder_fields(&self) -> &[FieldRef] {
        &self.holders
    }

    /// Returns `true` if any site is trace-cached.
    #[must_use]
    pub fn has_trace_sites(&self) -> bool {
        !self.trace_points.is_empty()
            || self
                .strategies
                .values()
                .any(|s| matches!(s, CacheStrategy::Trace { .. }))
    }

    /// Bound on the runtime path-trace length, announced on method entry.
    #[must_use]
    pub fn trace_depth(&self) -> u16 {
        self.trace_depth
    }
}

/// Resolves the external cachability decision for every staged site.
///
/// `carrier_class` is the runtime carrier type the holder fields are
/// declared with; `trace_depth` bounds the runtime path trace.
#[must_use]
pub fn plan_caches<P: StagePolicy>(
    body: &MethodBody,
    graph: &StageGraph,
    valueflow: &ValueFlowAnalysis,
    policy: &P,
    carrier_class: &ClassRef,
    trace_depth: u16,
) -> CachePlan {
    let mut plan = CachePlan {
        trace_depth,
        ..CachePlan::default()
    };

    for node in graph.staged_sources() {
        let site = node.staged().expect("staged by filter");
        let site_id = plan.site_ids.len() as u32;
        plan.site_ids.insert(node.id, site_id);

        let strategy = match policy.cachability(&site.op.member_id()) {
            Cachability::Permanent => {
                let holder = FieldRef {
                    class: ClassRef::new(body.class.clone()),
                    name: format!("stage$cache${site_id}").into(),
                    descriptor: JavaType::Object(carrier_class.name.clone()),
                    flags: FieldFlags::STATIC,
                };
                plan.holders.push(holder.clone());
                CacheStrategy::Permanent { holder }
            }
            Cachability::Trace => {
                let mut points = merge_points(site.args.iter().copied(), valueflow);
                points.sort_unstable();
                points.dedup();
                for &point in &points {
                    if !plan.trace_points.contains(&point) {
                        plan.trace_points.push(point);
                    }
                }
                CacheStrategy::Trace { points }
            }
            Cachability::None => CacheStrategy::None,
        };
        plan.strategies.insert(node.id, strategy);
    }

    plan.trace_points.sort_unstable();
    plan
}

/// Merge positions whose ambiguity reaches any of the given argument uses.
/// An argument fed from a join reports the synthetic merge identity as its
/// virtual source; arguments with a unique producer never do.
fn merge_points(
    args: impl Iterator<Item = crate::analysis::UseIndex>,
    valueflow: &ValueFlowAnalysis,
) -> Vec<u32> {
    let mut points = Vec::new();
    for arg in args {
        let Some(virtual_source) = valueflow.virtual_source_of(arg) else {
            continue;
        };
        if let SourceIndex::Merge { at, .. } = valueflow.sources().index_of(virtual_source) {
            points.push(*at);
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::TypeAnalysis,
        bytecode::{opcode as op, MethodBuilder, MethodDescriptor, MethodFlags, MethodRef, PoolEntry},
        stage::{
            build::build_stage_graph,
            policy::{Language, StageInfo, TablePolicy},
        },
    };
    use std::sync::Arc;

    fn staged_call() -> MethodRef {
        MethodRef {
            class: ClassRef::new("demo/Lang"),
            name: Arc::from("apply"),
            descriptor: MethodDescriptor::parse("(I)I").unwrap(),
        }
    }

    fn diamond_feeding_staged_call() -> MethodBody {
        // The staged call's argument merges two arms, so the merge position
        // becomes a trace point when the site is trace-cached.
        let mut b = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC).unwrap();
        let other = b.label();
        let join = b.label();
        b.op(op::ILOAD_0)
            .branch(op::IFEQ, other)
            .op(op::ICONST_1)
            .branch(op::GOTO, join)
            .bind(other)
            .op(op::ICONST_0)
            .bind(join)
            .pool_op(op::INVOKESTATIC, PoolEntry::Method(staged_call()))
            .op(op::IRETURN)
            .build()
            .unwrap()
    }

    fn plan_with(cachability: Cachability) -> (CachePlan, SourceId) {
        let body = diamond_feeding_staged_call();
        let mut policy = TablePolicy::new();
        policy.stage(
            staged_call().member_id(),
            StageInfo {
                language: Language::new("expr"),
                strict: false,
                static_info: vec![],
            },
        );
        policy.cache(staged_call().member_id(), cachability);
        let types = TypeAnalysis::run(&body).unwrap();
        let valueflow = crate::analysis::ValueFlowAnalysis::run(&body, &types).unwrap();
        let graph = build_stage_graph(&body, &types, &valueflow, &policy).unwrap();
        let staged = graph.staged_sources().next().unwrap().id;
        let plan = plan_caches(
            &body,
            &graph,
            &valueflow,
            &policy,
            &ClassRef::new("rt/Carrier"),
            16,
        );
        (plan, staged)
    }

    #[test]
    fn trace_sites_record_their_merge_points() {
        let (plan, staged) = plan_with(Cachability::Trace);
        match plan.strategy(staged) {
            CacheStrategy::Trace { points } => {
                // The two arms join right before the call at 9.
                assert_eq!(points, &[9]);
            }
            other => panic!("unexpected strategy {other:?}"),
        }
        assert_eq!(plan.trace_points(), &[9]);
        assert!(plan.has_trace_sites());
    }

    #[test]
    fn permanent_sites_get_one_holder_each() {
        let (plan, staged) = plan_with(Cachability::Permanent);
        match plan.strategy(staged) {
            CacheStrategy::Permanent { holder } => {
                assert_eq!(&*holder.name, "stage$cache$0");
                assert_eq!(&*holder.class.name, "t/T");
                assert_eq!(holder.descriptor, JavaType::Object(Arc::from("rt/Carrier")));
            }
            other => panic!("unexpected strategy {other:?}"),
        }
        assert_eq!(plan.holder_fields().len(), 1);
        assert!(!plan.has_trace_sites());
    }

    #[test]
    fn uncached_sites_stay_uncached() {
        let (plan, staged) = plan_with(Cachability::None);
        assert_eq!(plan.strategy(staged), &CacheStrategy::None);
        assert_eq!(plan.site_id(staged), Some(0));
        assert!(plan.trace_points().is_empty());
    }
}

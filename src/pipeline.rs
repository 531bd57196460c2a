//! The per-method weaving pipeline.
//!
//! [`Weaver`] drives the analyses in their strict dependency order, one
//! method body at a time: Type → ValueFlow → Constant → Stage graph → Cache
//! plan → Weave → apply. Every stage consumes the prior's immutable result
//! and shares the control flow built by the first. A method-level failure
//! anywhere in the chain leaves the method byte-identical to its input and
//! is reported through the `log` facade; only internal consistency
//! violations surface to the caller, since they indicate a pipeline bug
//! rather than a property of the input.

use rustc_hash::FxHashSet;

use crate::{
    analysis::{ConstantAnalysis, TypeAnalysis, ValueFlowAnalysis},
    bytecode::{FieldRef, MemberId, MethodBody, PoolEntry},
    stage::{build_stage_graph, plan_caches, CachedPolicy, StagePolicy},
    weave::{apply_plan, RuntimeSurface, SiteEmitter, WeaveAnalysis},
    Result,
};

/// Tunables of one weaver instance.
#[derive(Debug, Clone)]
pub struct WeaveConfig {
    /// Bodies longer than this many code bytes are skipped unwoven; the
    /// per-position state arrays grow linearly with code size.
    pub max_code_len: usize,
    /// Bound on the runtime path trace backing trace-cached sites.
    pub trace_depth: u16,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        WeaveConfig {
            max_code_len: 64 * 1024,
            trace_depth: 16,
        }
    }
}

/// A successfully woven method.
#[derive(Debug)]
pub struct WovenBody {
    /// The edited body with recomputed stack and local budgets.
    pub body: MethodBody,
    /// Synthetic static holder fields the declaring class must gain.
    pub holder_fields: Vec<FieldRef>,
}

/// Result of weaving one method.
#[derive(Debug)]
pub enum WeaveOutcome {
    /// Nothing staged, or a method-level failure: the input is used as-is.
    Unchanged,
    /// The rewritten method.
    Woven(WovenBody),
}

/// The pipeline driver.
///
/// Single-threaded and synchronous: each analysis runs to completion before
/// the next begins, and one method finishes before the next starts. The
/// policy cache lives for the weaver's lifetime, keyed by stable member
/// identifiers.
pub struct Weaver<P, E> {
    policy: CachedPolicy<P>,
    emitter: E,
    runtime: RuntimeSurface,
    config: WeaveConfig,
}

impl<P: StagePolicy, E: SiteEmitter> Weaver<P, E> {
    /// Creates a weaver over the given policy and code-emission service.
    pub fn new(policy: P, emitter: E, config: WeaveConfig) -> Self {
        Weaver {
            policy: CachedPolicy::new(policy),
            emitter,
            runtime: RuntimeSurface::default(),
            config,
        }
    }

    /// Replaces the runtime call surface the rewritten code targets.
    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeSurface) -> Self {
        self.runtime = runtime;
        self
    }

    /// Weaves one method body.
    ///
    /// # Errors
    ///
    /// Only [`Error::Internal`](crate::Error::Internal) reaches the caller.
    /// Every other failure is fatal to this method alone: it is logged and
    /// the outcome is [`WeaveOutcome::Unchanged`].
    pub fn weave(&mut self, body: &MethodBody) -> Result<WeaveOutcome> {
        match self.try_weave(body) {
            Ok(outcome) => Ok(outcome),
            Err(error) if error.is_method_level() => {
                log::warn!("leaving {} unwoven: {error}", body.member_id());
                Ok(WeaveOutcome::Unchanged)
            }
            Err(error) => Err(error),
        }
    }

    /// Weaves a batch of bodies, one outcome per input. Method-level
    /// failures never cascade across methods.
    ///
    /// # Errors
    ///
    /// Stops at the first internal consistency violation.
    pub fn weave_all<'b>(
        &mut self,
        bodies: impl IntoIterator<Item = &'b MethodBody>,
    ) -> Result<Vec<WeaveOutcome>> {
        bodies.into_iter().map(|body| self.weave(body)).collect()
    }

    fn try_weave(&mut self, body: &MethodBody) -> Result<WeaveOutcome> {
        if body.code.len() > self.config.max_code_len {
            return Err(bad_code!(
                0,
                "method body of {} bytes exceeds the configured limit of {}",
                body.code.len(),
                self.config.max_code_len
            ));
        }

        let types = TypeAnalysis::run(body)?;
        let valueflow = ValueFlowAnalysis::run(body, &types)?;

        // The constant pass must not fold staged finals; hand it an owned
        // set of the staged fields this body can reference.
        let staged_fields = self.staged_fields(body);
        let consts = ConstantAnalysis::run(body, &types, move |field| {
            staged_fields.contains(&field.member_id())
        })?;

        let graph = build_stage_graph(body, &types, &valueflow, &self.policy)?;
        if graph.staged_sources().next().is_none() {
            log::debug!("{} has no staged sites", body.member_id());
            return Ok(WeaveOutcome::Unchanged);
        }

        let caches = plan_caches(
            body,
            &graph,
            &valueflow,
            &self.policy,
            self.runtime.carrier_class(),
            self.config.trace_depth,
        );
        let weave = WeaveAnalysis::run(
            body,
            &types,
            &valueflow,
            &consts,
            &graph,
            &caches,
            &self.runtime,
            &mut self.emitter,
        )?;
        let (plan, pool) = weave.into_parts();
        if plan.is_empty() {
            return Ok(WeaveOutcome::Unchanged);
        }

        let woven = apply_plan(body, &plan, pool)?;
        log::debug!(
            "wove {} with {} edits and {} holder fields",
            body.member_id(),
            plan.len(),
            caches.holder_fields().len()
        );
        Ok(WeaveOutcome::Woven(WovenBody {
            body: woven,
            holder_fields: caches.holder_fields().to_vec(),
        }))
    }

    /// Staged fields referenced by this body's constant pool.
    fn staged_fields(&self, body: &MethodBody) -> FxHashSet<MemberId> {
        let mut staged = FxHashSet::default();
        for (_, entry) in body.pool.iter() {
            if let PoolEntry::Field(field) = entry {
                let member = field.member_id();
                if self.policy.stage_info(&member).is_some() {
                    staged.insert(member);
                }
            }
        }
        staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::{opcode as op, MethodBuilder, MethodFlags},
        stage::TablePolicy,
        weave::NullEmitter,
    };

    #[test]
    fn unstaged_method_is_unchanged() {
        let body = MethodBuilder::new("demo/Calc", "f", "(I)I", MethodFlags::STATIC)
            .unwrap()
            .op(op::ILOAD_0)
            .op(op::ICONST_1)
            .op(op::IADD)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let mut weaver = Weaver::new(TablePolicy::new(), NullEmitter, WeaveConfig::default());
        assert!(matches!(
            weaver.weave(&body).unwrap(),
            WeaveOutcome::Unchanged
        ));
    }

    #[test]
    fn oversized_method_is_skipped_not_fatal() {
        let body = MethodBuilder::new("demo/Calc", "f", "()V", MethodFlags::STATIC)
            .unwrap()
            .op(op::RETURN)
            .build()
            .unwrap();
        let mut weaver = Weaver::new(
            TablePolicy::new(),
            NullEmitter,
            WeaveConfig {
                max_code_len: 0,
                ..WeaveConfig::default()
            },
        );
        assert!(matches!(
            weaver.weave(&body).unwrap(),
            WeaveOutcome::Unchanged
        ));
    }

    #[test]
    fn malformed_code_is_skipped_not_fatal() {
        let body = MethodBody {
            class: std::sync::Arc::from("demo/Bad"),
            name: std::sync::Arc::from("f"),
            descriptor: crate::bytecode::MethodDescriptor::parse("()I").unwrap(),
            flags: MethodFlags::STATIC,
            max_stack: 1,
            max_locals: 0,
            // fload of a local that never received a value.
            code: vec![op::FLOAD, 0x00, op::IRETURN],
            handlers: Vec::new(),
            pool: std::sync::Arc::new(crate::bytecode::ConstPool::new()),
        };
        let mut weaver = Weaver::new(TablePolicy::new(), NullEmitter, WeaveConfig::default());
        assert!(matches!(
            weaver.weave(&body).unwrap(),
            WeaveOutcome::Unchanged
        ));
    }
}

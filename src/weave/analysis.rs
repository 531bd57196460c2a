//! The code-generation-decision pass.
//!
//! The weave analysis runs the engine one last time over a frame of
//! [`WeaveType`] slots, consuming everything the earlier passes produced:
//! the stage graph (which positions rewrite), the value-flow result (site
//! identities), the constant analysis (cheap constant carriers), the type
//! analysis (slot widths for spill sequences) and the cache plan.
//!
//! Per operand it records at most one of two mutually exclusive decisions:
//! *materialize* (the instruction demands a concrete value, force the
//! carrier right before use) or *adjust* (the rewritten consumer expects a
//! carrier, lift the concrete value right before use). Requesting both for
//! one (position, stack offset) is an internal consistency violation and is
//! fatal to the process, not the method.
//!
//! Two invariants keep the analysis frame's slot geometry identical to the
//! woven stack so the emitted spill sequences are valid in both worlds:
//! two-word staged values materialize immediately at their site, and a
//! definitely-carrying value stored to or loaded from a primitive-typed
//! local rewrites the transfer opcode to its reference form. What cannot be
//! decided statically (the `Maybe` half of the lattice) materializes
//! conservatively at every concrete use; the runtime's materialize entry
//! points pass non-carrier inputs through unchanged.

use rustc_hash::FxHashMap;

use crate::{
    analysis::{
        Analyzer, BinOp, Boxed, BranchKind, CaughtException, CmpKind, ConstantAnalysis,
        ConstKind, ConvKind, ElemType, Frame, FrameDomain, InvokeKind, InvokeOutcome, MonitorOp,
        NumType, Semantics, Slot, SourceId, SourceIndex, Step, TypeAnalysis, TypeVal,
        ValueFlowAnalysis, WordType,
    },
    bytecode::{
        opcode as op, BaseType, CallSiteRef, ClassRef, ConstPool, FieldRef, Instruction,
        JavaType, MethodBody, MethodDescriptor, MethodRef, Operand, PoolEntry,
    },
    stage::{CachePlan, CacheStrategy, SourceNode, StageGraph, StagedOp},
    weave::{
        carrier::WeaveType,
        plan::{synth, Edit, EditKind, EditPlan},
        runtime::{RuntimeSurface, SiteEmitter, StagedSiteDesc},
    },
    Error, Result,
};

/// Precedence of trace-record inserts; they run before any operand edit at
/// the same position. Part of the fixed edit-ordering protocol.
const PRECEDENCE_TRACE: i32 = 4096;

/// One operand decision.
#[derive(Debug, Clone, PartialEq)]
enum OpPlan {
    /// Force the carrier at this offset into a concrete `ty` value.
    Materialize { ty: JavaType },
    /// Wrap the concrete `ty` value at this offset into a carrier;
    /// provably-constant values use the cheaper constant entry point.
    Adjust { ty: JavaType, constant: bool },
}

/// A staged-site rewrite captured during the fixed point.
#[derive(Debug, Clone)]
struct SiteCall {
    source: SourceId,
    method: MethodRef,
    site_id: u32,
    /// Stack representation of each argument at the call, outermost first,
    /// after the insert-before edits ran.
    arg_reprs: Vec<JavaType>,
    /// Declared result type of the staged operation.
    result: Option<JavaType>,
    /// Materialize right after obtaining the carrier (strict sites and
    /// two-word results).
    immediate: bool,
    strategy: CacheStrategy,
}

/// The completed weave analysis of one method.
pub struct WeaveAnalysis {
    plan: EditPlan,
    pool: ConstPool,
    in_states: Vec<Option<Frame<WeaveType>>>,
    out_states: Vec<Option<Frame<WeaveType>>>,
}

impl WeaveAnalysis {
    /// Runs the decision pass and assembles the edit plan.
    ///
    /// # Errors
    ///
    /// Propagates engine failures; conflicting operand plans and broken
    /// slot-geometry invariants surface as [`Error::Internal`].
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        body: &MethodBody,
        types: &TypeAnalysis,
        valueflow: &ValueFlowAnalysis,
        consts: &ConstantAnalysis,
        graph: &StageGraph,
        caches: &CachePlan,
        runtime: &RuntimeSurface,
        emitter: &mut dyn SiteEmitter,
    ) -> Result<Self> {
        let mut analyzer = Analyzer::child_of(types.analyzer());
        let mut domain = FrameDomain::new(Boxed::new(WeaveSemantics {
            body,
            valueflow,
            consts,
            graph,
            caches,
            runtime,
            emitter,
            emitted: FxHashMap::default(),
            decisions: FxHashMap::default(),
            relocations: FxHashMap::default(),
            local_fixes: FxHashMap::default(),
            sites: FxHashMap::default(),
        }));
        analyzer.run(body, &mut domain)?;
        let semantics = domain.into_inner().into_inner();

        let len = analyzer.flow().code_len() as u32;
        let in_states: Vec<_> = (0..len).map(|p| analyzer.in_state(p).cloned()).collect();
        let out_states: Vec<_> = (0..len).map(|p| analyzer.out_state(p).cloned()).collect();

        let mut finalizer = Finalizer {
            body,
            types,
            runtime,
            caches,
            in_states: &in_states,
            plan: EditPlan::default(),
            pool: (*body.pool).clone(),
            pool_index: FxHashMap::default(),
        };
        finalizer.assemble(&semantics)?;

        Ok(WeaveAnalysis {
            plan: finalizer.plan,
            pool: finalizer.pool,
            in_states,
            out_states,
        })
    }

    /// The assembled edit plan.
    #[must_use]
    pub fn plan(&self) -> &EditPlan {
        &self.plan
    }

    /// The constant pool extended with the runtime and site references the
    /// plan's instructions use.
    #[must_use]
    pub fn pool(&self) -> &ConstPool {
        &self.pool
    }

    /// Consumes the analysis into its plan and extended pool.
    #[must_use]
    pub fn into_parts(self) -> (EditPlan, ConstPool) {
        (self.plan, self.pool)
    }

    /// Carrier state of the stack slot `depth` below the top, before `pos`.
    #[must_use]
    pub fn stack_in(&self, pos: u32, depth: u16) -> Option<WeaveType> {
        self.in_states
            .get(pos as usize)?
            .as_ref()?
            .peek(depth)
            .ok()?
            .value()
            .copied()
    }

    /// Carrier state of the stack slot `depth` below the top, after `pos`.
    #[must_use]
    pub fn stack_out(&self, pos: u32, depth: u16) -> Option<WeaveType> {
        self.out_states
            .get(pos as usize)?
            .as_ref()?
            .peek(depth)
            .ok()?
            .value()
            .copied()
    }
}

/// The weave frame semantics.
struct WeaveSemantics<'a> {
    body: &'a MethodBody,
    valueflow: &'a ValueFlowAnalysis,
    consts: &'a ConstantAnalysis,
    graph: &'a StageGraph,
    caches: &'a CachePlan,
    runtime: &'a RuntimeSurface,
    emitter: &'a mut dyn SiteEmitter,
    /// One emission per staged site, cached across fixed-point iterations.
    emitted: FxHashMap<SourceId, MethodRef>,
    /// Operand decisions per position and stack offset.
    decisions: FxHashMap<u32, FxHashMap<u16, OpPlan>>,
    /// Load/store opcode replacements for carrying primitive-typed locals.
    relocations: FxHashMap<u32, Instruction>,
    /// In-place local materializations (`iinc` on a carrying local).
    local_fixes: FxHashMap<u32, (u16, JavaType)>,
    /// Staged-site rewrites by position.
    sites: FxHashMap<u32, SiteCall>,
}

impl<'a> WeaveSemantics<'a> {
    /// Clears this position's decisions; each transfer recomputes them so
    /// the converged iteration is the one that sticks.
    fn begin(&mut self, pos: u32) {
        self.decisions.remove(&pos);
        self.relocations.remove(&pos);
        self.local_fixes.remove(&pos);
        self.sites.remove(&pos);
    }

    /// Records an operand decision; a materialize and an adjust for the
    /// same slot are structurally incompatible.
    fn record(&mut self, pos: u32, offset: u16, plan: OpPlan) -> Result<()> {
        let slot = self.decisions.entry(pos).or_default();
        if let Some(existing) = slot.get(&offset) {
            let conflict = !matches!(
                (existing, &plan),
                (OpPlan::Materialize { .. }, OpPlan::Materialize { .. })
                    | (OpPlan::Adjust { .. }, OpPlan::Adjust { .. })
            );
            if conflict {
                return Err(Error::Internal(format!(
                    "conflicting materialize and adjust plans at {pos} offset {offset}"
                )));
            }
        }
        slot.insert(offset, plan);
        Ok(())
    }

    /// The instruction demands a concrete value of `ty` at `offset`.
    fn concrete_use(
        &mut self,
        pos: u32,
        offset: u16,
        ty: &JavaType,
        value: WeaveType,
    ) -> Result<WeaveType> {
        if value.may_carry() {
            if ty.slots() == 2 {
                return Err(Error::Internal(format!(
                    "two-word slot unexpectedly carries at {pos} offset {offset}"
                )));
            }
            self.record(pos, offset, OpPlan::Materialize { ty: ty.clone() })?;
        }
        Ok(WeaveType::NotCarrying)
    }

    /// The rewritten consumer expects a carrier of `ty`'s value at
    /// `offset`; lift unless the slot already definitely carries.
    fn carrier_arg(
        &mut self,
        pos: u32,
        offset: u16,
        ty: &JavaType,
        value: WeaveType,
    ) -> Result<()> {
        if value.carries() {
            return Ok(());
        }
        let constant = value == WeaveType::NotCarrying
            && self
                .constant_at(pos, offset, ty)
                .is_some_and(|c| c.is_concrete);
        self.record(
            pos,
            offset,
            OpPlan::Adjust {
                ty: ty.clone(),
                constant,
            },
        )
    }

    /// Constant flowing into the operand at `offset`, if the constant pass
    /// proved one. Wide operands keep their payload under the sentinel.
    fn constant_at(
        &self,
        pos: u32,
        offset: u16,
        ty: &JavaType,
    ) -> Option<&'a crate::analysis::Constant> {
        let depth = offset + u16::from(ty.slots() == 2);
        self.consts.stack_constant(pos, depth)
    }

    /// The staged node rewriting the instruction at `pos`, if any.
    fn staged_at(&self, pos: u32) -> Option<&'a SourceNode> {
        let id = self
            .valueflow
            .sources()
            .id_of(&SourceIndex::StackPost { at: pos })?;
        let node = self.graph.source(id)?;
        node.staged().is_some().then_some(node)
    }

    /// Emits (once) the generated entry point for a staged site.
    fn emit_site(
        &mut self,
        node: &SourceNode,
        descriptor: MethodDescriptor,
    ) -> Result<MethodRef> {
        if let Some(method) = self.emitted.get(&node.id) {
            return Ok(method.clone());
        }
        let site = node.staged().expect("staged by caller");
        let desc = StagedSiteDesc {
            member: site.op.member_id(),
            language: site.language.clone(),
            strict: site.strict,
            static_info: site.static_info.clone(),
            descriptor,
        };
        let method = self.emitter.emit_invoke_site(&desc)?;
        if method.descriptor != desc.descriptor {
            return Err(Error::Lookup(format!(
                "emitted site {} does not carry the requested signature",
                method.member_id()
            )));
        }
        self.emitted.insert(node.id, method.clone());
        Ok(method)
    }

    /// Handles one staged operation: argument adjustment, site emission and
    /// the rewrite record. `declared` lists each argument's declared type in
    /// evaluation order; `result` is the declared result type.
    fn staged_site(
        &mut self,
        step: &Step<'_>,
        node: &SourceNode,
        declared: &[JavaType],
        values: &[WeaveType],
        result: Option<&JavaType>,
    ) -> Result<Option<WeaveType>> {
        let pos = step.pos();
        let site = node.staged().expect("staged by caller");

        // Offsets of each argument's topmost slot, outermost first.
        let mut offsets = vec![0u16; declared.len()];
        let mut above = 0u16;
        for (i, ty) in declared.iter().enumerate().rev() {
            offsets[i] = above;
            above += ty.slots();
        }

        let mut params = Vec::with_capacity(declared.len());
        for (i, ty) in declared.iter().enumerate() {
            let accepted = site
                .args
                .get(i)
                .and_then(|arg| self.graph.use_node(*arg))
                .is_some_and(|u| match &u.kind {
                    crate::stage::UseKind::Argument { accepts, .. } => {
                        accepts.contains(&site.language)
                    }
                    crate::stage::UseKind::Opaque => false,
                });
            if accepted {
                self.carrier_arg(pos, offsets[i], ty, values[i])?;
                params.push(self.runtime.carrier_type());
            } else {
                self.concrete_use(pos, offsets[i], ty, values[i])?;
                params.push(ty.clone());
            }
        }

        let returns_value = result.is_some();
        let descriptor = MethodDescriptor {
            params: params.clone(),
            ret: returns_value.then(|| self.runtime.carrier_type()),
        };
        let method = self.emit_site(node, descriptor)?;

        let site_id = self.caches.site_id(node.id).ok_or_else(|| {
            Error::Internal(format!("staged site {} missing from the cache plan", node.id))
        })?;
        let immediate =
            site.strict || result.is_some_and(|ty| ty.slots() == 2);
        self.sites.insert(
            pos,
            SiteCall {
                source: node.id,
                method,
                site_id,
                arg_reprs: params,
                result: result.cloned(),
                immediate,
                strategy: self.caches.strategy(node.id).clone(),
            },
        );

        if !returns_value {
            return Ok(None);
        }
        Ok(Some(if immediate {
            WeaveType::NotCarrying
        } else if matches!(site.op, StagedOp::FieldRead(_)) {
            WeaveType::GloballyCarrying
        } else {
            WeaveType::LocallyCarrying
        }))
    }

    /// Returns `true` if a carrier may legally flow into a sink declared
    /// with this reference type without materialization.
    fn sink_accepts_carrier(&self, declared: &JavaType) -> bool {
        declared == &JavaType::object() || declared == &self.runtime.carrier_type()
    }
}

fn num_type(ty: NumType) -> JavaType {
    JavaType::Base(match ty {
        NumType::Int => BaseType::Int,
        NumType::Long => BaseType::Long,
        NumType::Float => BaseType::Float,
        NumType::Double => BaseType::Double,
    })
}

fn word_type(ty: WordType) -> JavaType {
    match ty {
        WordType::Int => JavaType::Base(BaseType::Int),
        WordType::Long => JavaType::Base(BaseType::Long),
        WordType::Float => JavaType::Base(BaseType::Float),
        WordType::Double => JavaType::Base(BaseType::Double),
        WordType::Reference => JavaType::object(),
    }
}

impl Semantics for WeaveSemantics<'_> {
    type Value = WeaveType;

    fn entry_frame(&mut self, body: &MethodBody) -> Result<Frame<WeaveType>> {
        let mut frame = Frame::new(body.max_locals, body.max_stack);
        let mut slot = 0u16;
        if !body.is_static() {
            frame.set_local(slot, WeaveType::NotCarrying)?;
            slot += 1;
        }
        for param in &body.descriptor.params {
            if param.slots() == 2 {
                frame.set_local2(slot, WeaveType::NotCarrying)?;
            } else {
                frame.set_local(slot, WeaveType::NotCarrying)?;
            }
            slot += param.slots();
        }
        Ok(frame)
    }

    fn merge_values(&mut self, _pos: u32, a: &WeaveType, b: &WeaveType) -> Result<WeaveType> {
        Ok(a.merge(*b))
    }

    fn caught_value(&mut self, _pos: u32, _caught: &CaughtException) -> Result<WeaveType> {
        Ok(WeaveType::NotCarrying)
    }

    fn constant(&mut self, _step: &mut Step<'_>, _kind: &ConstKind) -> Result<WeaveType> {
        Ok(WeaveType::NotCarrying)
    }

    fn load(
        &mut self,
        step: &mut Step<'_>,
        ty: WordType,
        index: u16,
        value: &WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        // A carrier sitting in a primitive-typed local was stored through
        // the reference form; the load must match.
        if value.carries() && matches!(ty, WordType::Int | WordType::Float) {
            self.relocations
                .insert(pos, synth(op::ALOAD, Operand::Local(index)));
        }
        Ok(*value)
    }

    fn store(
        &mut self,
        step: &mut Step<'_>,
        ty: WordType,
        index: u16,
        value: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        match ty {
            WordType::Int | WordType::Float => {
                if value.carries() {
                    self.relocations
                        .insert(pos, synth(op::ASTORE, Operand::Local(index)));
                    return Ok(value);
                }
                // An ambiguous primitive never settles in a local: resolve
                // it here so locals are either concrete or definite
                // carriers.
                self.concrete_use(pos, 0, &word_type(ty), value)
            }
            WordType::Long | WordType::Double => {
                if value.may_carry() {
                    return Err(Error::Internal(format!(
                        "two-word local store unexpectedly carries at {pos}"
                    )));
                }
                Ok(value)
            }
            WordType::Reference => Ok(value),
        }
    }

    fn array_load(
        &mut self,
        step: &mut Step<'_>,
        _elem: ElemType,
        array: WeaveType,
        index: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::Base(BaseType::Int), index)?;
        self.concrete_use(pos, 1, &JavaType::object(), array)?;
        Ok(WeaveType::NotCarrying)
    }

    fn array_store(
        &mut self,
        step: &mut Step<'_>,
        elem: ElemType,
        array: WeaveType,
        index: WeaveType,
        value: WeaveType,
    ) -> Result<()> {
        let pos = step.pos();
        self.begin(pos);
        let value_ty = match elem {
            ElemType::Long => JavaType::Base(BaseType::Long),
            ElemType::Double => JavaType::Base(BaseType::Double),
            ElemType::Float => JavaType::Base(BaseType::Float),
            ElemType::Reference => JavaType::object(),
            _ => JavaType::Base(BaseType::Int),
        };
        let w = value_ty.slots();
        self.concrete_use(pos, 0, &value_ty, value)?;
        self.concrete_use(pos, w, &JavaType::Base(BaseType::Int), index)?;
        self.concrete_use(pos, w + 1, &JavaType::object(), array)?;
        Ok(())
    }

    fn binary(
        &mut self,
        step: &mut Step<'_>,
        bin_op: BinOp,
        ty: NumType,
        lhs: WeaveType,
        rhs: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        let shift = matches!(bin_op, BinOp::Shl | BinOp::Shr | BinOp::Ushr);
        let rhs_ty = if shift {
            JavaType::Base(BaseType::Int)
        } else {
            num_type(ty)
        };
        self.concrete_use(pos, 0, &rhs_ty, rhs)?;
        self.concrete_use(pos, rhs_ty.slots(), &num_type(ty), lhs)?;
        Ok(WeaveType::NotCarrying)
    }

    fn negate(
        &mut self,
        step: &mut Step<'_>,
        ty: NumType,
        value: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &num_type(ty), value)
    }

    fn iinc(
        &mut self,
        step: &mut Step<'_>,
        index: u16,
        _delta: i16,
        value: &WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        if value.may_carry() {
            self.local_fixes
                .insert(pos, (index, JavaType::Base(BaseType::Int)));
        }
        Ok(WeaveType::NotCarrying)
    }

    fn convert(
        &mut self,
        step: &mut Step<'_>,
        kind: ConvKind,
        value: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &num_type(kind.from_ty()), value)
    }

    fn compare(
        &mut self,
        step: &mut Step<'_>,
        kind: CmpKind,
        lhs: WeaveType,
        rhs: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        let ty = match kind {
            CmpKind::Long => NumType::Long,
            CmpKind::FloatL | CmpKind::FloatG => NumType::Float,
            CmpKind::DoubleL | CmpKind::DoubleG => NumType::Double,
        };
        self.concrete_use(pos, 0, &num_type(ty), rhs)?;
        self.concrete_use(pos, num_type(ty).slots(), &num_type(ty), lhs)?;
        Ok(WeaveType::NotCarrying)
    }

    fn branch(
        &mut self,
        step: &mut Step<'_>,
        kind: BranchKind,
        operands: &[WeaveType],
    ) -> Result<()> {
        let pos = step.pos();
        self.begin(pos);
        let ty = match kind {
            BranchKind::IfZero(_) | BranchKind::IfICmp(_) => JavaType::Base(BaseType::Int),
            BranchKind::IfACmp(_) | BranchKind::IfNull(_) => JavaType::object(),
            BranchKind::Goto => return Ok(()),
        };
        for (i, &value) in operands.iter().rev().enumerate() {
            self.concrete_use(pos, i as u16, &ty, value)?;
        }
        Ok(())
    }

    fn switch(&mut self, step: &mut Step<'_>, value: WeaveType) -> Result<()> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::Base(BaseType::Int), value)?;
        Ok(())
    }

    fn return_value(
        &mut self,
        step: &mut Step<'_>,
        value: Option<(WordType, WeaveType)>,
    ) -> Result<()> {
        let pos = step.pos();
        self.begin(pos);
        let Some((ty, value)) = value else {
            return Ok(());
        };
        let declared = self
            .body
            .descriptor
            .ret
            .clone()
            .unwrap_or_else(|| word_type(ty));
        // A global carrier may cross the method boundary when the declared
        // return type can hold it.
        if ty == WordType::Reference
            && value == WeaveType::GloballyCarrying
            && self.sink_accepts_carrier(&declared)
        {
            return Ok(());
        }
        self.concrete_use(pos, 0, &declared, value)?;
        Ok(())
    }

    fn throw(&mut self, step: &mut Step<'_>, value: WeaveType) -> Result<()> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::object(), value)?;
        Ok(())
    }

    fn get_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<WeaveType>,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        if let Some(node) = self.staged_at(pos) {
            let mut declared = Vec::new();
            let mut values = Vec::new();
            if let Some(receiver) = receiver {
                declared.push(JavaType::Object(field.class.name.clone()));
                values.push(receiver);
            }
            let result = field.descriptor.clone();
            return Ok(self
                .staged_site(step, node, &declared, &values, Some(&result))?
                .expect("field reads produce a value"));
        }
        if let Some(receiver) = receiver {
            self.concrete_use(pos, 0, &JavaType::object(), receiver)?;
        }
        Ok(WeaveType::NotCarrying)
    }

    fn put_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<WeaveType>,
        value: WeaveType,
    ) -> Result<()> {
        let pos = step.pos();
        self.begin(pos);
        if let Some(node) = self.staged_at(pos) {
            let mut declared = Vec::new();
            let mut values = Vec::new();
            if let Some(receiver) = receiver {
                declared.push(JavaType::Object(field.class.name.clone()));
                values.push(receiver);
            }
            declared.push(field.descriptor.clone());
            values.push(value);
            self.staged_site(step, node, &declared, &values, None)?;
            return Ok(());
        }
        let w = field.descriptor.slots();
        if field.descriptor.is_reference()
            && value == WeaveType::GloballyCarrying
            && self.sink_accepts_carrier(&field.descriptor)
        {
            // Global carriers may rest in compatible reference fields.
        } else {
            self.concrete_use(pos, 0, &field.descriptor, value)?;
        }
        if let Some(receiver) = receiver {
            self.concrete_use(pos, w, &JavaType::object(), receiver)?;
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        step: &mut Step<'_>,
        kind: InvokeKind,
        method: &MethodRef,
        args: Vec<WeaveType>,
    ) -> Result<InvokeOutcome<WeaveType>> {
        let pos = step.pos();
        self.begin(pos);

        let constructor_call = kind == InvokeKind::Special && method.is_constructor();
        if !constructor_call {
            if let Some(node) = self.staged_at(pos) {
                let mut declared = Vec::new();
                if kind.has_receiver() {
                    declared.push(JavaType::Object(method.class.name.clone()));
                }
                declared.extend(method.descriptor.params.iter().cloned());
                let result = self
                    .staged_site(step, node, &declared, &args, method.descriptor.ret.as_ref())?;
                return Ok(InvokeOutcome::returning(result));
            }
        }

        // Ordinary call: every operand must be concrete.
        let mut declared = Vec::new();
        if kind.has_receiver() {
            declared.push(JavaType::Object(method.class.name.clone()));
        }
        declared.extend(method.descriptor.params.iter().cloned());
        let mut above = 0u16;
        for (ty, &value) in declared.iter().zip(args.iter()).rev() {
            self.concrete_use(pos, above, ty, value)?;
            above += ty.slots();
        }
        Ok(InvokeOutcome::returning(
            method.descriptor.ret.as_ref().map(|_| WeaveType::NotCarrying),
        ))
    }

    fn invoke_dynamic(
        &mut self,
        step: &mut Step<'_>,
        site: &CallSiteRef,
        args: Vec<WeaveType>,
    ) -> Result<Option<WeaveType>> {
        let pos = step.pos();
        self.begin(pos);
        let mut above = 0u16;
        for (ty, &value) in site.descriptor.params.iter().zip(args.iter()).rev() {
            self.concrete_use(pos, above, ty, value)?;
            above += ty.slots();
        }
        Ok(site
            .descriptor
            .ret
            .as_ref()
            .map(|_| WeaveType::NotCarrying))
    }

    fn new_object(&mut self, _step: &mut Step<'_>, _class: &ClassRef) -> Result<WeaveType> {
        Ok(WeaveType::NotCarrying)
    }

    fn new_array(
        &mut self,
        step: &mut Step<'_>,
        _array_ty: &JavaType,
        counts: Vec<WeaveType>,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        for (i, &count) in counts.iter().rev().enumerate() {
            self.concrete_use(pos, i as u16, &JavaType::Base(BaseType::Int), count)?;
        }
        Ok(WeaveType::NotCarrying)
    }

    fn array_length(&mut self, step: &mut Step<'_>, array: WeaveType) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::object(), array)
    }

    fn check_cast(
        &mut self,
        step: &mut Step<'_>,
        _class: &ClassRef,
        value: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::object(), value)
    }

    fn instance_of(
        &mut self,
        step: &mut Step<'_>,
        _class: &ClassRef,
        value: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::object(), value)
    }

    fn monitor(
        &mut self,
        step: &mut Step<'_>,
        _op: MonitorOp,
        value: WeaveType,
    ) -> Result<()> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::object(), value)?;
        Ok(())
    }

    fn box_value(
        &mut self,
        step: &mut Step<'_>,
        prim: BaseType,
        value: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::Base(prim), value)
    }

    fn unbox_value(
        &mut self,
        step: &mut Step<'_>,
        _prim: BaseType,
        value: WeaveType,
    ) -> Result<WeaveType> {
        let pos = step.pos();
        self.begin(pos);
        self.concrete_use(pos, 0, &JavaType::object(), value)
    }
}

/// Turns the converged decisions into the ordered edit plan.
struct Finalizer<'a> {
    body: &'a MethodBody,
    types: &'a TypeAnalysis,
    runtime: &'a RuntimeSurface,
    caches: &'a CachePlan,
    in_states: &'a [Option<Frame<WeaveType>>],
    plan: EditPlan,
    pool: ConstPool,
    pool_index: FxHashMap<String, u16>,
}

impl Finalizer<'_> {
    fn assemble(&mut self, semantics: &WeaveSemantics<'_>) -> Result<()> {
        // Trace plumbing first: it anchors at fixed positions regardless of
        // the operand decisions.
        if semantics.caches.has_trace_sites() {
            let enter = self.invoke_static(&self.runtime.trace_enter());
            let depth = i32::from(self.caches.trace_depth());
            self.plan.push(Edit {
                pos: 0,
                kind: EditKind::InsertBeforeExclusive,
                precedence: 0,
                code: vec![synth(op::SIPUSH, Operand::Immediate(depth)), enter],
            });
        }
        for (idx, &point) in self.caches.trace_points().iter().enumerate() {
            let record = self.invoke_static(&self.runtime.trace_record());
            self.plan.push(Edit {
                pos: point,
                kind: EditKind::InsertBefore,
                precedence: PRECEDENCE_TRACE,
                code: vec![synth(op::SIPUSH, Operand::Immediate(idx as i32)), record],
            });
        }

        let mut positions: Vec<u32> = semantics.decisions.keys().copied().collect();
        positions.sort_unstable();
        for pos in positions {
            let mut offsets: Vec<u16> =
                semantics.decisions[&pos].keys().copied().collect();
            offsets.sort_unstable_by(|a, b| b.cmp(a));
            for offset in offsets {
                let plan = semantics.decisions[&pos][&offset].clone();
                let code = self.operand_edit(pos, offset, &plan)?;
                self.plan.push(Edit {
                    pos,
                    kind: EditKind::InsertBefore,
                    precedence: i32::from(offset),
                    code,
                });
            }
        }

        let mut fixes: Vec<(u32, (u16, JavaType))> = semantics
            .local_fixes
            .iter()
            .map(|(&p, f)| (p, f.clone()))
            .collect();
        fixes.sort_unstable_by_key(|(p, _)| *p);
        for (pos, (index, ty)) in fixes {
            let materialize = self.invoke_static(&self.runtime.materialize(&ty));
            let code = vec![
                synth(op::ALOAD, Operand::Local(index)),
                materialize,
                store_for(&ty, index),
            ];
            self.plan.push(Edit {
                pos,
                kind: EditKind::InsertBefore,
                precedence: 0,
                code,
            });
        }

        let mut relocations: Vec<(u32, Instruction)> = semantics
            .relocations
            .iter()
            .map(|(&p, i)| (p, i.clone()))
            .collect();
        relocations.sort_unstable_by_key(|(p, _)| *p);
        for (pos, insn) in relocations {
            self.plan.push(Edit {
                pos,
                kind: EditKind::Rewrite,
                precedence: 0,
                code: vec![insn],
            });
        }

        let mut sites: Vec<(u32, SiteCall)> = semantics
            .sites
            .iter()
            .map(|(&p, s)| (p, s.clone()))
            .collect();
        sites.sort_unstable_by_key(|(p, _)| *p);
        for (pos, site) in sites {
            let code = self.site_edit(&site)?;
            self.plan.push(Edit {
                pos,
                kind: EditKind::Rewrite,
                precedence: 0,
                code,
            });
        }
        Ok(())
    }

    /// Interns a pool entry, deduplicating by rendering.
    fn intern(&mut self, entry: PoolEntry) -> u16 {
        let key = format!("{entry:?}");
        if let Some(&idx) = self.pool_index.get(&key) {
            return idx;
        }
        let idx = self.pool.push(entry);
        self.pool_index.insert(key, idx);
        idx
    }

    fn invoke_static(&mut self, method: &MethodRef) -> Instruction {
        let idx = self.intern(PoolEntry::Method(method.clone()));
        synth(op::INVOKESTATIC, Operand::Pool(idx))
    }

    /// Builds a stack-neutral edit that applies `plan` to the operand
    /// `offset` slots below the top: spill everything above to fresh
    /// temporaries, run the conversion, reload.
    fn operand_edit(&mut self, pos: u32, offset: u16, plan: &OpPlan) -> Result<Vec<Instruction>> {
        let core = match plan {
            OpPlan::Materialize { ty } => self.invoke_static(&self.runtime.materialize(ty)),
            OpPlan::Adjust { ty, constant: true } => {
                self.invoke_static(&self.runtime.make_constant(ty))
            }
            OpPlan::Adjust {
                ty,
                constant: false,
            } => self.invoke_static(&self.runtime.lift(ty)),
        };
        let (mut code, reloads) = self.spill_above(pos, offset)?;
        code.push(core);
        code.extend(reloads);
        Ok(code)
    }

    /// Spill stores for every slot above `offset` at `pos`, plus the loads
    /// restoring them, typed from the type analysis with carrying slots
    /// overridden to their reference form.
    fn spill_above(&mut self, pos: u32, offset: u16) -> Result<(Vec<Instruction>, Vec<Instruction>)> {
        let types = self.types.frame_at(pos).ok_or_else(|| {
            Error::Internal(format!("no type frame at woven position {pos}"))
        })?;
        let weave = self.in_states[pos as usize].as_ref().ok_or_else(|| {
            Error::Internal(format!("no weave frame at woven position {pos}"))
        })?;

        let mut stores = Vec::new();
        let mut loads = Vec::new();
        let mut depth = 0u16;
        while depth < offset {
            let (ty, width) = match types.peek(depth).map_err(internal_frame)? {
                Slot::High => {
                    let below = types.peek(depth + 1).map_err(internal_frame)?;
                    match below.value() {
                        Some(wide @ (TypeVal::Long | TypeVal::Double)) => (wide.clone(), 2),
                        other => {
                            return Err(Error::Internal(format!(
                                "sentinel over {other:?} in spill at {pos}"
                            )))
                        }
                    }
                }
                Slot::Value(v) => (v.clone(), 1),
                Slot::Empty => {
                    return Err(Error::Internal(format!(
                        "dead slot in spill at {pos} depth {depth}"
                    )))
                }
            };
            let carrying = weave
                .peek(depth + width - 1)
                .ok()
                .and_then(Slot::value)
                .copied()
                .is_some_and(WeaveType::carries);
            let (store, load) = spill_ops(&ty, carrying, pos)?;
            let temp = self.body.max_locals + self.plan.reserve_temps(width);
            stores.push(synth(store, Operand::Local(temp)));
            loads.push(synth(load, Operand::Local(temp)));
            depth += width;
        }
        if depth != offset {
            return Err(Error::Internal(format!(
                "operand boundary splits a two-word value at {pos}"
            )));
        }
        loads.reverse();
        Ok((stores, loads))
    }

    /// Builds the rewrite replacing a staged instruction: the generated
    /// site call, wrapped per caching strategy, with an immediate
    /// materialization for strict sites and two-word results.
    fn site_edit(&mut self, site: &SiteCall) -> Result<Vec<Instruction>> {
        let call = self.invoke_static(&site.method);
        let mut code: Vec<Instruction> = Vec::new();

        match (&site.strategy, site.result.is_some()) {
            (CacheStrategy::Permanent { holder }, true) => {
                // Park the arguments so the holder check can discard them on
                // the fast path; only a cache miss reloads and evaluates.
                let mut stores = Vec::new();
                let mut loads = Vec::new();
                for repr in site.arg_reprs.iter().rev() {
                    let (store, load) = spill_ops_for_type(repr);
                    let temp = self.body.max_locals + self.plan.reserve_temps(repr.slots());
                    stores.push(synth(store, Operand::Local(temp)));
                    loads.push(synth(load, Operand::Local(temp)));
                }
                loads.reverse();

                let holder_idx = self.intern(PoolEntry::Field(holder.clone()));
                code.extend(stores);
                code.push(synth(op::GETSTATIC, Operand::Pool(holder_idx)));
                code.push(synth(op::DUP, Operand::None));
                let branch_at = code.len();
                code.push(synth(op::IFNONNULL, Operand::Branch(0)));
                code.push(synth(op::POP, Operand::None));
                code.extend(loads);
                code.push(call);
                code.push(synth(op::DUP, Operand::None));
                code.push(synth(op::PUTSTATIC, Operand::Pool(holder_idx)));
                let join = code.len();
                code.push(synth(op::NOP, Operand::None));
                code[branch_at].operand = Operand::Branch(join as i32);
            }
            (CacheStrategy::Trace { .. }, true) => {
                code.push(call);
                code.push(synth(
                    op::SIPUSH,
                    Operand::Immediate(site.site_id as i32),
                ));
                let cached = self.invoke_static(&self.runtime.cached_closure());
                code.push(cached);
            }
            _ => code.push(call),
        }

        if site.immediate {
            let result = site.result.as_ref().ok_or_else(|| {
                Error::Internal(format!(
                    "immediate staged site {} has no result type",
                    site.source
                ))
            })?;
            code.push(self.invoke_static(&self.runtime.materialize(result)));
        }
        Ok(code)
    }
}

fn internal_frame(e: Error) -> Error {
    Error::Internal(format!("spill planning failed: {e}"))
}

/// Store/load opcode pair for a spilled slot.
fn spill_ops(ty: &TypeVal, carrying: bool, pos: u32) -> Result<(u8, u8)> {
    if carrying {
        return Ok((op::ASTORE, op::ALOAD));
    }
    Ok(match ty {
        TypeVal::Int => (op::ISTORE, op::ILOAD),
        TypeVal::Float => (op::FSTORE, op::FLOAD),
        TypeVal::Long => (op::LSTORE, op::LLOAD),
        TypeVal::Double => (op::DSTORE, op::DLOAD),
        TypeVal::Null | TypeVal::Reference(_) | TypeVal::Uninit { .. } | TypeVal::UninitThis(_) => {
            (op::ASTORE, op::ALOAD)
        }
        TypeVal::Bogus => {
            return Err(Error::Internal(format!(
                "spill of a dead slot at {pos}"
            )))
        }
    })
}

/// Store/load opcode pair for a declared type.
fn spill_ops_for_type(ty: &JavaType) -> (u8, u8) {
    match ty {
        JavaType::Base(BaseType::Long) => (op::LSTORE, op::LLOAD),
        JavaType::Base(BaseType::Double) => (op::DSTORE, op::DLOAD),
        JavaType::Base(BaseType::Float) => (op::FSTORE, op::FLOAD),
        JavaType::Base(_) => (op::ISTORE, op::ILOAD),
        _ => (op::ASTORE, op::ALOAD),
    }
}

/// Store opcode for a declared type at a local index.
fn store_for(ty: &JavaType, index: u16) -> Instruction {
    let (store, _) = spill_ops_for_type(ty);
    synth(store, Operand::Local(index))
}

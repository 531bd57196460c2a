//! Two-pass construction of the stage graph.
//!
//! Pass 1 (*discovery*) runs the engine once to find and index every staged
//! site, tracking the constructor-initialization protocol so a staged field
//! write on a not-yet-initialized receiver is rejected before any graph
//! exists. Opaque sources and uses come straight from the value-flow tables.
//!
//! *Interest selection* then closes over the value-flow result: a staged
//! source marks its argument uses, every source feeding an interesting use
//! becomes interesting, and every use consuming an interesting source does
//! too. The closure keeps control and data paths connected through opaque
//! intermediate nodes.
//!
//! Pass 2 (*control-edge registration*) re-runs the engine with a frontier
//! domain over the same control flow: the state at each position is the set
//! of most recent interesting nodes on the incoming paths, so runs of
//! uninteresting positions collapse into direct edges. Falling off the end
//! of normal control flow is caught by the engine's exit hook and routed to
//! the synthetic [`NodeRef::Exit`] sentinel.

use smallvec::SmallVec;

use rustc_hash::FxHashMap;

use crate::{
    analysis::{
        Analyzer, Boxed, CaughtException, CmpKind, ConstKind, ConvKind, Domain, ElemType, Frame,
        FrameDomain, InitStatus, InvokeKind, InvokeOutcome, MonitorOp, NumType, Semantics,
        SourceId, SourceIndex, Step, TypeAnalysis, UseIndex, ValueFlowAnalysis, WordType,
    },
    bytecode::{
        BaseType, CallSiteRef, ClassRef, FieldRef, JavaType, MemberId, MethodBody, MethodRef,
    },
    stage::{
        graph::StageGraph,
        node::{NodeRef, SourceKind, SourceNode, StagedOp, StagedSite, UseKind, UseNode},
        policy::StagePolicy,
    },
    Error, Result,
};

/// Builds the stage graph of one method.
///
/// # Errors
///
/// Returns [`Error::PolicyViolation`] for a staged field write on an
/// uninitialized receiver, [`Error::Internal`] if the value-flow result is
/// missing an identity the discovery pass relies on, and propagates engine
/// failures.
pub fn build_stage_graph<P: StagePolicy>(
    body: &MethodBody,
    types: &TypeAnalysis,
    valueflow: &ValueFlowAnalysis,
    policy: &P,
) -> Result<StageGraph> {
    let mut graph = StageGraph::default();

    // Pass 1: discovery.
    let mut analyzer = Analyzer::child_of(types.analyzer());
    let mut domain = FrameDomain::new(Boxed::new(Discover {
        policy,
        valueflow,
        context: body.member_id(),
        graph: &mut graph,
    }));
    analyzer.run(body, &mut domain)?;

    // Interest selection: close over the value-flow result.
    select_interest(&mut graph, valueflow);

    // Pass 2: control-edge registration over the interesting nodes.
    let at_position = positions_of_interest(&graph, valueflow);
    let mut analyzer = Analyzer::child_of(types.analyzer());
    let mut control = ControlEdges {
        graph: &mut graph,
        valueflow,
        at_position,
    };
    analyzer.run(body, &mut control)?;

    // Data edges, skipping endpoints that did not survive filtering.
    let mut interesting_uses: Vec<UseIndex> = graph.interesting_uses.iter().copied().collect();
    interesting_uses.sort_unstable_by_key(|u| (u.at, u.operand));
    for use_index in interesting_uses {
        let Some(sources) = valueflow.sources_of(use_index) else {
            continue;
        };
        for &source in sources {
            if graph.interesting_sources.contains(&source) {
                graph.add_data(source, use_index);
            }
        }
    }

    verify_complete(&graph, valueflow)?;
    Ok(graph)
}

/// Discovery semantics: initialization tracking plus staged-site indexing.
///
/// The slot value is just the construction status; everything else the
/// discovery needs is already in the value-flow tables.
struct Discover<'a, P> {
    policy: &'a P,
    valueflow: &'a ValueFlowAnalysis,
    context: MemberId,
    graph: &'a mut StageGraph,
}

impl<P: StagePolicy> Discover<'_, P> {
    /// The value-flow identity of the instruction at `pos`. Every staged
    /// operation has one by construction; its absence is a pipeline bug.
    fn site_source(&self, pos: u32) -> Result<SourceId> {
        self.valueflow
            .sources()
            .id_of(&SourceIndex::StackPost { at: pos })
            .ok_or_else(|| {
                Error::Internal(format!("staged site at {pos} has no value-flow identity"))
            })
    }

    /// Looks up the staging annotation, honoring lexical suppression.
    fn staged_info(&self, member: &MemberId) -> Option<crate::stage::policy::StageInfo> {
        let info = self.policy.stage_info(member)?;
        if self.policy.is_suppressed(&self.context, &info.language) {
            return None;
        }
        Some(info)
    }

    /// Registers a staged site and its argument uses.
    fn register_site(&mut self, pos: u32, op: StagedOp, arg_count: u16) -> Result<()> {
        let member = op.member_id();
        let Some(info) = self.staged_info(&member) else {
            return Ok(());
        };
        let id = self.site_source(pos)?;
        let args: Vec<UseIndex> = (0..arg_count)
            .map(|operand| UseIndex { at: pos, operand })
            .collect();
        for (position, &arg) in args.iter().enumerate() {
            self.graph.arena.add_use(UseNode {
                index: arg,
                kind: UseKind::Argument {
                    of: id,
                    position: position as u16,
                    accepts: self.policy.accept_info(&member, position as u16),
                },
            });
        }
        self.graph.arena.add_source(SourceNode {
            id,
            pos: Some(pos),
            kind: SourceKind::Staged(Box::new(StagedSite {
                op,
                language: info.language,
                strict: info.strict,
                static_info: info.static_info,
                args,
            })),
        });
        Ok(())
    }
}

impl<P: StagePolicy> Semantics for Discover<'_, P> {
    type Value = InitStatus;

    fn entry_frame(&mut self, body: &MethodBody) -> Result<Frame<InitStatus>> {
        let mut frame = Frame::new(body.max_locals, body.max_stack);
        let mut slot = 0u16;
        if !body.is_static() {
            let receiver = if body.is_constructor() {
                InitStatus::UninitializedThis
            } else {
                InitStatus::Initialized
            };
            frame.set_local(slot, receiver)?;
            slot += 1;
        }
        for param in &body.descriptor.params {
            if param.slots() == 2 {
                frame.set_local2(slot, InitStatus::Initialized)?;
            } else {
                frame.set_local(slot, InitStatus::Initialized)?;
            }
            slot += param.slots();
        }
        Ok(frame)
    }

    fn merge_values(&mut self, _pos: u32, a: &InitStatus, b: &InitStatus) -> Result<InitStatus> {
        Ok(if a == b { *a } else { InitStatus::Initialized })
    }

    fn caught_value(&mut self, _pos: u32, _caught: &CaughtException) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn constant(&mut self, _step: &mut Step<'_>, _kind: &ConstKind) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn load(
        &mut self,
        _step: &mut Step<'_>,
        _ty: WordType,
        _index: u16,
        value: &InitStatus,
    ) -> Result<InitStatus> {
        Ok(*value)
    }

    fn store(
        &mut self,
        _step: &mut Step<'_>,
        _ty: WordType,
        _index: u16,
        value: InitStatus,
    ) -> Result<InitStatus> {
        Ok(value)
    }

    fn array_load(
        &mut self,
        _step: &mut Step<'_>,
        _elem: ElemType,
        _array: InitStatus,
        _index: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn array_store(
        &mut self,
        _step: &mut Step<'_>,
        _elem: ElemType,
        _array: InitStatus,
        _index: InitStatus,
        _value: InitStatus,
    ) -> Result<()> {
        Ok(())
    }

    fn binary(
        &mut self,
        _step: &mut Step<'_>,
        _op: crate::analysis::BinOp,
        _ty: NumType,
        _lhs: InitStatus,
        _rhs: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn negate(
        &mut self,
        _step: &mut Step<'_>,
        _ty: NumType,
        _value: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn iinc(
        &mut self,
        _step: &mut Step<'_>,
        _index: u16,
        _delta: i16,
        _value: &InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn convert(
        &mut self,
        _step: &mut Step<'_>,
        _kind: ConvKind,
        _value: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn compare(
        &mut self,
        _step: &mut Step<'_>,
        _kind: CmpKind,
        _lhs: InitStatus,
        _rhs: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn get_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<InitStatus>,
    ) -> Result<InitStatus> {
        let arg_count = u16::from(receiver.is_some());
        self.register_site(step.pos(), StagedOp::FieldRead(field.clone()), arg_count)?;
        Ok(InitStatus::Initialized)
    }

    fn put_field(
        &mut self,
        step: &mut Step<'_>,
        field: &FieldRef,
        receiver: Option<InitStatus>,
        _value: InitStatus,
    ) -> Result<()> {
        let member = field.member_id();
        if self.staged_info(&member).is_some() {
            // The object-construction rules leave no legal splice point for
            // a deferred write into a receiver that does not yet exist.
            if let Some(status) = receiver {
                if status != InitStatus::Initialized {
                    return Err(Error::PolicyViolation {
                        message: format!(
                            "staged write to {member} before the receiver is initialized"
                        ),
                        pos: step.pos(),
                    });
                }
            }
            let arg_count = 1 + u16::from(receiver.is_some());
            self.register_site(step.pos(), StagedOp::FieldWrite(field.clone()), arg_count)?;
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        step: &mut Step<'_>,
        kind: InvokeKind,
        method: &MethodRef,
        args: Vec<InitStatus>,
    ) -> Result<InvokeOutcome<InitStatus>> {
        let pos = step.pos();
        let mut replace_all = None;
        if kind == InvokeKind::Special && method.is_constructor() {
            if let Some(&receiver) = args.first() {
                if receiver != InitStatus::Initialized {
                    replace_all = Some((receiver, InitStatus::Initialized));
                }
            }
        } else {
            self.register_site(
                pos,
                StagedOp::Call(method.clone(), kind),
                args.len() as u16,
            )?;
        }
        let result = method
            .descriptor
            .ret
            .as_ref()
            .map(|_| InitStatus::Initialized);
        Ok(InvokeOutcome {
            result,
            replace_all,
        })
    }

    fn invoke_dynamic(
        &mut self,
        _step: &mut Step<'_>,
        site: &CallSiteRef,
        _args: Vec<InitStatus>,
    ) -> Result<Option<InitStatus>> {
        Ok(site.descriptor.ret.as_ref().map(|_| InitStatus::Initialized))
    }

    fn new_object(&mut self, step: &mut Step<'_>, _class: &ClassRef) -> Result<InitStatus> {
        Ok(InitStatus::UninitializedNew(step.pos()))
    }

    fn new_array(
        &mut self,
        _step: &mut Step<'_>,
        _array_ty: &JavaType,
        _counts: Vec<InitStatus>,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn array_length(&mut self, _step: &mut Step<'_>, _array: InitStatus) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn check_cast(
        &mut self,
        _step: &mut Step<'_>,
        _class: &ClassRef,
        value: InitStatus,
    ) -> Result<InitStatus> {
        Ok(value)
    }

    fn instance_of(
        &mut self,
        _step: &mut Step<'_>,
        _class: &ClassRef,
        _value: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn monitor(
        &mut self,
        _step: &mut Step<'_>,
        _op: MonitorOp,
        _value: InitStatus,
    ) -> Result<()> {
        Ok(())
    }

    fn box_value(
        &mut self,
        _step: &mut Step<'_>,
        _prim: BaseType,
        _value: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }

    fn unbox_value(
        &mut self,
        _step: &mut Step<'_>,
        _prim: BaseType,
        _value: InitStatus,
    ) -> Result<InitStatus> {
        Ok(InitStatus::Initialized)
    }
}

/// Marks staged sources and their arguments, then closes bidirectionally
/// over the value-flow edges so paths through opaque intermediates stay
/// connected. Opaque nodes the closure reaches are materialized from the
/// value-flow tables on the way.
fn select_interest(graph: &mut StageGraph, valueflow: &ValueFlowAnalysis) {
    enum Item {
        Source(SourceId),
        Use(UseIndex),
    }

    let mut worklist: Vec<Item> = Vec::new();
    for node in graph.staged_sources() {
        worklist.push(Item::Source(node.id));
        for &arg in &node.staged().expect("staged by filter").args {
            worklist.push(Item::Use(arg));
        }
    }

    while let Some(item) = worklist.pop() {
        match item {
            Item::Source(id) => {
                if !graph.interesting_sources.insert(id) {
                    continue;
                }
                if !graph.arena.sources.contains_key(&id) {
                    graph.arena.add_source(SourceNode {
                        id,
                        pos: source_position(valueflow, id),
                        kind: SourceKind::Opaque,
                    });
                }
                for &use_index in valueflow.uses_of(id) {
                    worklist.push(Item::Use(use_index));
                }
            }
            Item::Use(use_index) => {
                if !graph.interesting_uses.insert(use_index) {
                    continue;
                }
                if !graph.arena.uses.contains_key(&use_index) {
                    graph.arena.add_use(UseNode {
                        index: use_index,
                        kind: UseKind::Opaque,
                    });
                }
                if let Some(sources) = valueflow.sources_of(use_index) {
                    for &source in sources {
                        worklist.push(Item::Source(source));
                    }
                }
            }
        }
    }
}

/// Instruction position behind a source identity, when it has one.
fn source_position(valueflow: &ValueFlowAnalysis, id: SourceId) -> Option<u32> {
    match valueflow.sources().index_of(id) {
        SourceIndex::Entry { .. } => None,
        SourceIndex::StackPost { at }
        | SourceIndex::LocalPost { at, .. }
        | SourceIndex::Merge { at, .. }
        | SourceIndex::Caught { at } => Some(*at),
    }
}

/// Interesting nodes bucketed by position, in evaluation order: the caught
/// exception and merge identities exist before the instruction runs, then
/// operands are consumed, then results are produced.
fn positions_of_interest(
    graph: &StageGraph,
    valueflow: &ValueFlowAnalysis,
) -> FxHashMap<u32, Vec<NodeRef>> {
    // Rank within one position; lower ranks happen first.
    fn rank(node: &NodeRef, valueflow: &ValueFlowAnalysis) -> (u8, u32) {
        match node {
            NodeRef::Source(id) => match valueflow.sources().index_of(*id) {
                SourceIndex::Caught { .. } => (0, 0),
                SourceIndex::Merge { ordinal, .. } => (1, *ordinal),
                SourceIndex::StackPost { .. } => (3, 0),
                SourceIndex::LocalPost { slot, .. } => (4, u32::from(*slot)),
                SourceIndex::Entry { .. } => (0, 0),
            },
            NodeRef::Use(_, operand) => (2, u32::from(*operand)),
            NodeRef::Entry | NodeRef::Exit => (0, 0),
        }
    }

    let mut buckets: FxHashMap<u32, Vec<NodeRef>> = FxHashMap::default();
    for &id in &graph.interesting_sources {
        if let Some(pos) = source_position(valueflow, id) {
            buckets.entry(pos).or_default().push(NodeRef::Source(id));
        }
    }
    for &use_index in &graph.interesting_uses {
        buckets
            .entry(use_index.at)
            .or_default()
            .push(NodeRef::of_use(use_index));
    }
    for nodes in buckets.values_mut() {
        nodes.sort_by_key(|n| rank(n, valueflow));
    }
    buckets
}

/// The pass-2 frontier: most recent interesting nodes on the incoming
/// paths, kept sorted so state comparison is order-independent.
type Frontier = SmallVec<[NodeRef; 2]>;

fn frontier_insert(frontier: &mut Frontier, node: NodeRef) {
    if let Err(at) = frontier.binary_search(&node) {
        frontier.insert(at, node);
    }
}

/// Control-edge registration domain.
struct ControlEdges<'a> {
    graph: &'a mut StageGraph,
    valueflow: &'a ValueFlowAnalysis,
    at_position: FxHashMap<u32, Vec<NodeRef>>,
}

impl Domain for ControlEdges<'_> {
    type State = Frontier;

    fn entry_state(&mut self, _body: &MethodBody) -> Result<Frontier> {
        let mut frontier: Frontier = SmallVec::new();
        frontier.push(NodeRef::Entry);

        // Interesting parameter sources occur before the first instruction,
        // chained in slot order.
        let mut entries: Vec<(u16, SourceId)> = self
            .graph
            .interesting_sources
            .iter()
            .filter_map(
                |&id| match self.valueflow.sources().index_of(id) {
                    SourceIndex::Entry { slot } => Some((*slot, id)),
                    _ => None,
                },
            )
            .collect();
        entries.sort_unstable();
        for (_, id) in entries {
            let node = NodeRef::Source(id);
            for &from in frontier.iter() {
                self.graph.add_control(from, node);
            }
            frontier.clear();
            frontier.push(node);
        }
        Ok(frontier)
    }

    fn merge(&mut self, _pos: u32, a: &Frontier, b: &Frontier) -> Result<Frontier> {
        let mut out = a.clone();
        for &node in b {
            frontier_insert(&mut out, node);
        }
        Ok(out)
    }

    fn merge_exceptional(
        &mut self,
        _pos: u32,
        pred_out: &Frontier,
        _caught: &CaughtException,
    ) -> Result<Frontier> {
        Ok(pred_out.clone())
    }

    fn transfer(&mut self, step: &mut Step<'_>, state: &mut Frontier) -> Result<()> {
        let Some(nodes) = self.at_position.get(&step.pos()) else {
            return Ok(());
        };
        for &node in nodes {
            for &from in state.iter() {
                self.graph.add_control(from, node);
            }
            state.clear();
            state.push(node);
        }
        Ok(())
    }

    fn exit(&mut self, _pos: u32, state: &Frontier) -> Result<()> {
        for &from in state.iter() {
            self.graph.add_control(from, NodeRef::Exit);
        }
        Ok(())
    }
}

/// The hand-off invariant: a staged source surviving selection must have
/// every argument use resolved with at least one producer. Anything less is
/// an analysis-ordering bug, not a property of the input.
fn verify_complete(graph: &StageGraph, valueflow: &ValueFlowAnalysis) -> Result<()> {
    for node in graph.staged_sources() {
        let site = node.staged().expect("staged by filter");
        if !graph.interesting_sources.contains(&node.id) {
            return Err(Error::Internal(format!(
                "staged source {} missing from the interest set",
                node.id
            )));
        }
        for &arg in &site.args {
            if !graph.arena.uses.contains_key(&arg) {
                return Err(Error::Internal(format!(
                    "staged argument {arg:?} was never indexed"
                )));
            }
            if valueflow
                .sources_of(arg)
                .is_none_or(<[SourceId]>::is_empty)
            {
                return Err(Error::Internal(format!(
                    "staged argument {arg:?} has no producers"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::{opcode as op, FieldFlags, MethodBuilder, MethodFlags, PoolEntry},
        stage::policy::{Language, StageInfo, TablePolicy},
    };
    use std::sync::Arc;

    fn staged_field(name: &str) -> FieldRef {
        FieldRef {
            class: ClassRef::new("demo/Lang"),
            name: Arc::from(name),
            descriptor: JavaType::parse("I").unwrap(),
            flags: FieldFlags::STATIC,
        }
    }

    fn policy_staging(member: MemberId) -> TablePolicy {
        let mut policy = TablePolicy::new();
        policy.stage(
            member,
            StageInfo {
                language: Language::new("expr"),
                strict: false,
                static_info: vec![],
            },
        );
        policy
    }

    fn build(body: &MethodBody, policy: &TablePolicy) -> Result<StageGraph> {
        let types = TypeAnalysis::run(body).unwrap();
        let valueflow = ValueFlowAnalysis::run(body, &types).unwrap();
        build_stage_graph(body, &types, &valueflow, policy)
    }

    #[test]
    fn staged_read_becomes_a_staged_source() {
        let field = staged_field("staged");
        let body = MethodBuilder::new("t/T", "g", "()I", MethodFlags::STATIC)
            .unwrap()
            .pool_op(op::GETSTATIC, PoolEntry::Field(field.clone()))
            .op(op::IRETURN)
            .build()
            .unwrap();
        let policy = policy_staging(field.member_id());
        let graph = build(&body, &policy).unwrap();

        let staged: Vec<_> = graph.staged_sources().collect();
        assert_eq!(staged.len(), 1);
        let site = staged[0].staged().unwrap();
        assert_eq!(site.op, StagedOp::FieldRead(field));
        assert!(site.args.is_empty());
        // Entry -> staged read -> consuming return -> exit.
        let node = NodeRef::Source(staged[0].id);
        assert!(graph.reaches_from_entry(node));
        assert!(graph.reaches_from_entry(NodeRef::Exit));
        // The return consumes the staged value along a data edge.
        let uses = graph.data_out(staged[0].id);
        assert_eq!(uses, &[UseIndex { at: 3, operand: 0 }]);
    }

    #[test]
    fn suppression_degrades_to_opaque() {
        let field = staged_field("staged");
        let body = MethodBuilder::new("t/T", "g", "()I", MethodFlags::STATIC)
            .unwrap()
            .pool_op(op::GETSTATIC, PoolEntry::Field(field.clone()))
            .op(op::IRETURN)
            .build()
            .unwrap();
        let mut policy = policy_staging(field.member_id());
        policy.suppress(body.member_id(), Language::new("expr"));
        let graph = build(&body, &policy).unwrap();
        assert_eq!(graph.staged_sources().count(), 0);
    }

    #[test]
    fn interest_closure_bridges_opaque_intermediates() {
        // The staged value flows through a local store/load before its use.
        let field = staged_field("staged");
        let body = MethodBuilder::new("t/T", "g", "()I", MethodFlags::STATIC)
            .unwrap()
            .pool_op(op::GETSTATIC, PoolEntry::Field(field.clone())) // 0
            .local_op(op::ISTORE, 0) // 3
            .local_op(op::ILOAD, 0) // 5
            .op(op::IRETURN) // 7
            .build()
            .unwrap();
        let policy = policy_staging(field.member_id());
        let graph = build(&body, &policy).unwrap();

        // The store use, the re-load source and the return use all became
        // interesting through the closure.
        assert!(graph.is_interesting(NodeRef::Use(3, 0)));
        assert!(graph.is_interesting(NodeRef::Use(7, 0)));
        let reload = graph
            .use_node(UseIndex { at: 7, operand: 0 })
            .map(|u| graph.data_in(u.index).to_vec())
            .unwrap();
        assert_eq!(reload.len(), 1);
    }

    #[test]
    fn staged_write_after_super_is_legal() {
        let field = FieldRef {
            class: ClassRef::new("t/Foo"),
            name: Arc::from("staged_field"),
            descriptor: JavaType::parse("I").unwrap(),
            flags: FieldFlags::empty(),
        };
        let super_init = PoolEntry::Method(MethodRef {
            class: ClassRef::new("java/lang/Object"),
            name: Arc::from("<init>"),
            descriptor: crate::bytecode::MethodDescriptor::parse("()V").unwrap(),
        });
        let body = MethodBuilder::new("t/Foo", "<init>", "()V", MethodFlags::empty())
            .unwrap()
            .op(op::ALOAD_0)
            .pool_op(op::INVOKESPECIAL, super_init)
            .op(op::ALOAD_0)
            .op(op::ICONST_1)
            .pool_op(op::PUTFIELD, PoolEntry::Field(field.clone()))
            .op(op::RETURN)
            .build()
            .unwrap();
        let policy = policy_staging(field.member_id());
        let graph = build(&body, &policy).unwrap();
        assert_eq!(graph.staged_sources().count(), 1);
    }

    #[test]
    fn staged_write_before_super_is_rejected() {
        let field = FieldRef {
            class: ClassRef::new("t/Foo"),
            name: Arc::from("staged_field"),
            descriptor: JavaType::parse("I").unwrap(),
            flags: FieldFlags::empty(),
        };
        let super_init = PoolEntry::Method(MethodRef {
            class: ClassRef::new("java/lang/Object"),
            name: Arc::from("<init>"),
            descriptor: crate::bytecode::MethodDescriptor::parse("()V").unwrap(),
        });
        let body = MethodBuilder::new("t/Foo", "<init>", "()V", MethodFlags::empty())
            .unwrap()
            .op(op::ALOAD_0)
            .op(op::ICONST_1)
            .pool_op(op::PUTFIELD, PoolEntry::Field(field.clone()))
            .op(op::ALOAD_0)
            .pool_op(op::INVOKESPECIAL, super_init)
            .op(op::RETURN)
            .build()
            .unwrap();
        let policy = policy_staging(field.member_id());
        assert!(matches!(
            build(&body, &policy),
            Err(Error::PolicyViolation { .. })
        ));
    }

    #[test]
    fn control_edges_collapse_uninteresting_runs() {
        let field = staged_field("staged");
        let body = MethodBuilder::new("t/T", "g", "(I)I", MethodFlags::STATIC)
            .unwrap()
            .op(op::ILOAD_0) // 0: uninteresting arithmetic around the site
            .op(op::ICONST_1) // 1
            .op(op::IADD) // 2
            .op(op::POP) // 3
            .pool_op(op::GETSTATIC, PoolEntry::Field(field.clone())) // 4
            .op(op::IRETURN) // 7
            .build()
            .unwrap();
        let policy = policy_staging(field.member_id());
        let graph = build(&body, &policy).unwrap();
        let staged_id = graph.staged_sources().next().unwrap().id;
        // The run of plain arithmetic collapses: the staged source's only
        // control predecessor is the entry sentinel.
        assert_eq!(
            graph.control_in(NodeRef::Source(staged_id)),
            &[NodeRef::Entry]
        );
    }
}

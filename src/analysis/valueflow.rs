//! Value-flow analysis: which producers can reach which consumers.
//!
//! For every value-producing point (a *source*) this pass computes the set
//! of value-consuming points (*uses*) that may observe it, across merges.
//! Sources are interned as [`SourceIndex`] values: the stack top after an
//! instruction, a local slot after an in-place update, a synthetic merge
//! identity, the method entry, or a caught exception. Plain copies (loads,
//! stores, casts) are transparent: the value keeps its identity.
//!
//! # Virtual Sources
//!
//! Each tracked value carries a *virtual source* identity. When two frames
//! merge and a slot's virtual sources differ, the slot needs a fresh merge
//! identity — but two slots merging the *same* pair of identities at one
//! position must receive one shared identity, not two. A correspondence
//! table keyed by (merge position, incoming pair) performs that coalescing;
//! without it, staged-argument provenance would be split into spuriously
//! distinct groups.
//!
//! A union-find partition additionally ties together every pair of sources
//! that ever co-occur in one merged value, giving later passes the
//! equivalence classes that decide uniform treatment of merge origins.
//!
//! # Object Construction
//!
//! A `new` result carries `UninitializedNew` (and `this` in a constructor
//! `UninitializedThis`) until the matching `<init>` invocation; at that
//! single point every slot holding the same identity is rewritten in place
//! to the initialized value and the position is recorded for passes that
//! must insert code exactly once there.

use smallvec::SmallVec;

use rustc_hash::FxHashMap;

use crate::{
    analysis::{
        boxing::Boxed,
        dispatch::{
            BranchKind, CmpKind, ConstKind, ConvKind, ElemType, FrameDomain, InvokeKind,
            InvokeOutcome, MonitorOp, NumType, Semantics, WordType,
        },
        engine::{Analyzer, Step},
        flow::CaughtException,
        frame::Frame,
        typeflow::TypeAnalysis,
    },
    bytecode::{
        BaseType, CallSiteRef, ClassRef, FieldRef, JavaType, MethodBody, MethodRef,
    },
    Result,
};

/// Stable identity of a value-producing point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceIndex {
    /// A parameter (or receiver) local at method entry.
    Entry {
        /// Local slot index.
        slot: u16,
    },
    /// The stack top after the instruction at `at`.
    StackPost {
        /// Instruction position.
        at: u32,
    },
    /// Local `slot` after the in-place update at `at`.
    LocalPost {
        /// Instruction position.
        at: u32,
        /// Local slot index.
        slot: u16,
    },
    /// A synthetic identity for a merge at `at`; `ordinal` distinguishes
    /// distinct incoming pairs coalesced at the same position.
    Merge {
        /// Merge position.
        at: u32,
        /// Pair ordinal at this position.
        ordinal: u32,
    },
    /// The caught exception at a handler entry.
    Caught {
        /// Handler entry position.
        at: u32,
    },
}

/// Dense source identifier.
pub type SourceId = u32;

/// Identity of a value-consuming operand: instruction position plus operand
/// number in evaluation order (the receiver of a call is operand 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UseIndex {
    /// Instruction position.
    pub at: u32,
    /// Operand number.
    pub operand: u16,
}

/// Sorted set of source ids; small in the common case.
pub type SourceSet = SmallVec<[SourceId; 4]>;

fn set_insert(set: &mut SourceSet, id: SourceId) {
    if let Err(at) = set.binary_search(&id) {
        set.insert(at, id);
    }
}

fn set_union(a: &SourceSet, b: &SourceSet) -> SourceSet {
    let mut out = a.clone();
    for &id in b {
        set_insert(&mut out, id);
    }
    out
}

/// Initialization status of a reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// Ordinary, fully constructed value.
    Initialized,
    /// Result of the `new` at the given position, before `<init>`.
    UninitializedNew(u32),
    /// `this` in a constructor before the superclass constructor ran.
    UninitializedThis,
}

/// The tracked abstract value: contributing sources, a virtual identity and
/// the construction status.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedValue {
    /// All sources that may have produced this value.
    pub sources: SourceSet,
    /// Identity used to distinguish genuinely-new merged values from
    /// coincidentally-equal ones.
    pub virtual_source: SourceId,
    /// Construction status.
    pub init: InitStatus,
}

/// Interning table from [`SourceIndex`] to dense ids.
#[derive(Debug, Default)]
pub struct SourceTable {
    by_index: FxHashMap<SourceIndex, SourceId>,
    entries: Vec<SourceIndex>,
}

impl SourceTable {
    /// Interns `index`, returning its stable id.
    pub fn intern(&mut self, index: SourceIndex) -> SourceId {
        if let Some(&id) = self.by_index.get(&index) {
            return id;
        }
        let id = self.entries.len() as SourceId;
        self.entries.push(index);
        self.by_index.insert(index, id);
        id
    }

    /// Looks up an already-interned index.
    #[must_use]
    pub fn id_of(&self, index: &SourceIndex) -> Option<SourceId> {
        self.by_index.get(index).copied()
    }

    /// The index behind `id`.
    #[must_use]
    pub fn index_of(&self, id: SourceId) -> &SourceIndex {
        &self.entries[id as usize]
    }

    /// Number of interned sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Union-find over source ids.
#[derive(Debug, Default)]
struct Partition {
    parent: Vec<u32>,
}

impl Partition {
    fn ensure(&mut self, id: SourceId) {
        while self.parent.len() <= id as usize {
            self.parent.push(self.parent.len() as u32);
        }
    }

    fn find(&mut self, id: SourceId) -> SourceId {
        self.ensure(id);
        let mut root = id;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cursor = id;
        while self.parent[cursor as usize] != root {
            let next = self.parent[cursor as usize];
            self.parent[cursor as usize] = root;
            cursor = next;
        }
        root
    }

    fn union(&mut self, a: SourceId, b: SourceId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb.max(ra) as usize] = rb.min(ra);
        }
    }
}

/// The value-flow semantics.
struct ValueFlowSemantics {
    table: SourceTable,
    partition: Partition,
    /// (merge position, lesser incoming id, greater incoming id) -> merge id.
    correspondence: FxHashMap<(u32, SourceId, SourceId), SourceId>,
    /// Next merge ordinal per position.
    merge_ordinals: FxHashMap<u32, u32>,
    /// Final source sets per use.
    uses: FxHashMap<UseIndex, SourceSet>,
    /// Virtual source observed by each use (merge identities included).
    use_virtuals: FxHashMap<UseIndex, SourceId>,
    /// `<init>` call position -> virtual source of the initialized value.
    init_points: FxHashMap<u32, SourceId>,
}

impl ValueFlowSemantics {
    fn new() -> Self {
        ValueFlowSemantics {
            table: SourceTable::default(),
            partition: Partition::default(),
            correspondence: FxHashMap::default(),
            merge_ordinals: FxHashMap::default(),
            uses: FxHashMap::default(),
            use_virtuals: FxHashMap::default(),
            init_points: FxHashMap::default(),
        }
    }

    fn fresh(&mut self, index: SourceIndex, init: InitStatus) -> TrackedValue {
        let id = self.table.intern(index);
        self.partition.ensure(id);
        let mut sources = SourceSet::new();
        sources.push(id);
        TrackedValue {
            sources,
            virtual_source: id,
            init,
        }
    }

    fn stack_post(&mut self, pos: u32) -> TrackedValue {
        self.fresh(SourceIndex::StackPost { at: pos }, InitStatus::Initialized)
    }

    fn record_use(&mut self, pos: u32, operand: u16, value: &TrackedValue) {
        let index = UseIndex { at: pos, operand };
        self.uses.insert(index, value.sources.clone());
        self.use_virtuals.insert(index, value.virtual_source);
    }
}

impl Semantics for ValueFlowSemantics {
    type Value = TrackedValue;

    fn entry_frame(&mut self, body: &MethodBody) -> Result<Frame<TrackedValue>> {
        let mut frame = Frame::new(body.max_locals, body.max_stack);
        let mut slot = 0u16;
        if !body.is_static() {
            let init = if body.is_constructor() {
                InitStatus::UninitializedThis
            } else {
                InitStatus::Initialized
            };
            let value = self.fresh(SourceIndex::Entry { slot }, init);
            frame.set_local(slot, value)?;
            slot += 1;
        }
        for param in &body.descriptor.params {
            let value = self.fresh(SourceIndex::Entry { slot }, InitStatus::Initialized);
            if param.slots() == 2 {
                frame.set_local2(slot, value)?;
            } else {
                frame.set_local(slot, value)?;
            }
            slot += param.slots();
        }
        Ok(frame)
    }

    fn merge_values(
        &mut self,
        pos: u32,
        a: &TrackedValue,
        b: &TrackedValue,
    ) -> Result<TrackedValue> {
        if a == b {
            return Ok(a.clone());
        }
        let sources = set_union(&a.sources, &b.sources);
        // Everything that co-occurs in one merged value shares a class.
        if let Some((&first, rest)) = sources.split_first() {
            for &other in rest {
                self.partition.union(first, other);
            }
        }
        let virtual_source = if a.virtual_source == b.virtual_source {
            a.virtual_source
        } else {
            let lo = a.virtual_source.min(b.virtual_source);
            let hi = a.virtual_source.max(b.virtual_source);
            if let Some(&existing) = self.correspondence.get(&(pos, lo, hi)) {
                existing
            } else {
                let ordinal_slot = self.merge_ordinals.entry(pos).or_insert(0);
                let ordinal = *ordinal_slot;
                *ordinal_slot += 1;
                let id = self.table.intern(SourceIndex::Merge { at: pos, ordinal });
                self.partition.ensure(id);
                self.partition.union(id, lo);
                self.partition.union(id, hi);
                self.correspondence.insert((pos, lo, hi), id);
                id
            }
        };
        // A status conflict means the value is dead past the join; the type
        // pass rejects any use of such a slot.
        let init = if a.init == b.init {
            a.init
        } else {
            InitStatus::Initialized
        };
        Ok(TrackedValue {
            sources,
            virtual_source,
            init,
        })
    }

    fn caught_value(&mut self, pos: u32, _caught: &CaughtException) -> Result<TrackedValue> {
        Ok(self.fresh(SourceIndex::Caught { at: pos }, InitStatus::Initialized))
    }

    fn constant(&mut self, step: &mut Step<'_>, _kind: &ConstKind) -> Result<TrackedValue> {
        Ok(self.stack_post(step.pos()))
    }

    fn load(
        &mut self,
        _step: &mut Step<'_>,
        _ty: WordType,
        _index: u16,
        value: &TrackedValue,
    ) -> Result<TrackedValue> {
        Ok(value.clone())
    }

    fn store(
        &mut self,
        step: &mut Step<'_>,
        _ty: WordType,
        _index: u16,
        value: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &value);
        // A store is a transparent copy: the value keeps its identity so
        // provenance survives local round trips (and the `<init>` rewrite
        // can find every alias of an uninitialized receiver).
        Ok(value)
    }

    fn array_load(
        &mut self,
        step: &mut Step<'_>,
        _elem: ElemType,
        array: TrackedValue,
        index: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &array);
        self.record_use(step.pos(), 1, &index);
        Ok(self.stack_post(step.pos()))
    }

    fn array_store(
        &mut self,
        step: &mut Step<'_>,
        _elem: ElemType,
        array: TrackedValue,
        index: TrackedValue,
        value: TrackedValue,
    ) -> Result<()> {
        self.record_use(step.pos(), 0, &array);
        self.record_use(step.pos(), 1, &index);
        self.record_use(step.pos(), 2, &value);
        Ok(())
    }

    fn binary(
        &mut self,
        step: &mut Step<'_>,
        _op: crate::analysis::BinOp,
        _ty: NumType,
        lhs: TrackedValue,
        rhs: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &lhs);
        self.record_use(step.pos(), 1, &rhs);
        Ok(self.stack_post(step.pos()))
    }

    fn negate(
        &mut self,
        step: &mut Step<'_>,
        _ty: NumType,
        value: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &value);
        Ok(self.stack_post(step.pos()))
    }

    fn iinc(
        &mut self,
        step: &mut Step<'_>,
        index: u16,
        _delta: i16,
        value: &TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, value);
        Ok(self.fresh(
            SourceIndex::LocalPost {
                at: step.pos(),
                slot: index,
            },
            InitStatus::Initialized,
        ))
    }

    fn convert(
        &mut self,
        step: &mut Step<'_>,
        _kind: ConvKind,
        value: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &value);
        Ok(self.stack_post(step.pos()))
    }

    fn compare(
        &mut self,
        step: &mut Step<'_>,
        _kind: CmpKind,
        lhs: TrackedValue,
        rhs: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &lhs);
        self.record_use(step.pos(), 1, &rhs);
        Ok(self.stack_post(step.pos()))
    }

    fn branch(
        &mut self,
        step: &mut Step<'_>,
        _kind: BranchKind,
        operands: &[TrackedValue],
    ) -> Result<()> {
        for (i, v) in operands.iter().enumerate() {
            self.record_use(step.pos(), i as u16, v);
        }
        Ok(())
    }

    fn switch(&mut self, step: &mut Step<'_>, value: TrackedValue) -> Result<()> {
        self.record_use(step.pos(), 0, &value);
        Ok(())
    }

    fn return_value(
        &mut self,
        step: &mut Step<'_>,
        value: Option<(WordType, TrackedValue)>,
    ) -> Result<()> {
        if let Some((_, v)) = value {
            self.record_use(step.pos(), 0, &v);
        }
        Ok(())
    }

    fn throw(&mut self, step: &mut Step<'_>, value: TrackedValue) -> Result<()> {
        self.record_use(step.pos(), 0, &value);
        Ok(())
    }

    fn get_field(
        &mut self,
        step: &mut Step<'_>,
        _field: &FieldRef,
        receiver: Option<TrackedValue>,
    ) -> Result<TrackedValue> {
        if let Some(receiver) = receiver {
            self.record_use(step.pos(), 0, &receiver);
        }
        Ok(self.stack_post(step.pos()))
    }

    fn put_field(
        &mut self,
        step: &mut Step<'_>,
        _field: &FieldRef,
        receiver: Option<TrackedValue>,
        value: TrackedValue,
    ) -> Result<()> {
        // Field writes produce no stack value but still need a source
        // identity: a staged write is itself a graph node.
        self.table.intern(SourceIndex::StackPost { at: step.pos() });
        let mut operand = 0u16;
        if let Some(receiver) = receiver {
            self.record_use(step.pos(), operand, &receiver);
            operand += 1;
        }
        self.record_use(step.pos(), operand, &value);
        Ok(())
    }

    fn invoke(
        &mut self,
        step: &mut Step<'_>,
        kind: InvokeKind,
        method: &MethodRef,
        args: Vec<TrackedValue>,
    ) -> Result<InvokeOutcome<TrackedValue>> {
        let pos = step.pos();
        for (i, arg) in args.iter().enumerate() {
            self.record_use(pos, i as u16, arg);
        }
        let mut replace_all = None;
        if kind == InvokeKind::Special && method.is_constructor() {
            if let Some(receiver) = args.first() {
                if receiver.init != InitStatus::Initialized {
                    let initialized = TrackedValue {
                        sources: receiver.sources.clone(),
                        virtual_source: receiver.virtual_source,
                        init: InitStatus::Initialized,
                    };
                    self.init_points.insert(pos, receiver.virtual_source);
                    replace_all = Some((receiver.clone(), initialized));
                }
            }
        }
        // Void calls keep a source identity for the stage graph.
        self.table.intern(SourceIndex::StackPost { at: pos });
        let result = method
            .descriptor
            .ret
            .as_ref()
            .map(|_| self.stack_post(pos));
        Ok(InvokeOutcome {
            result,
            replace_all,
        })
    }

    fn invoke_dynamic(
        &mut self,
        step: &mut Step<'_>,
        site: &CallSiteRef,
        args: Vec<TrackedValue>,
    ) -> Result<Option<TrackedValue>> {
        let pos = step.pos();
        for (i, arg) in args.iter().enumerate() {
            self.record_use(pos, i as u16, arg);
        }
        Ok(site.descriptor.ret.as_ref().map(|_| self.stack_post(pos)))
    }

    fn new_object(&mut self, step: &mut Step<'_>, _class: &ClassRef) -> Result<TrackedValue> {
        let pos = step.pos();
        Ok(self.fresh(
            SourceIndex::StackPost { at: pos },
            InitStatus::UninitializedNew(pos),
        ))
    }

    fn new_array(
        &mut self,
        step: &mut Step<'_>,
        _array_ty: &JavaType,
        counts: Vec<TrackedValue>,
    ) -> Result<TrackedValue> {
        for (i, count) in counts.iter().enumerate() {
            self.record_use(step.pos(), i as u16, count);
        }
        Ok(self.stack_post(step.pos()))
    }

    fn array_length(
        &mut self,
        step: &mut Step<'_>,
        array: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &array);
        Ok(self.stack_post(step.pos()))
    }

    fn check_cast(
        &mut self,
        step: &mut Step<'_>,
        _class: &ClassRef,
        value: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &value);
        // The cast narrows the type but keeps the value's identity.
        Ok(value)
    }

    fn instance_of(
        &mut self,
        step: &mut Step<'_>,
        _class: &ClassRef,
        value: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &value);
        Ok(self.stack_post(step.pos()))
    }

    fn monitor(
        &mut self,
        step: &mut Step<'_>,
        _op: MonitorOp,
        value: TrackedValue,
    ) -> Result<()> {
        self.record_use(step.pos(), 0, &value);
        Ok(())
    }

    fn box_value(
        &mut self,
        step: &mut Step<'_>,
        _prim: BaseType,
        value: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &value);
        Ok(self.stack_post(step.pos()))
    }

    fn unbox_value(
        &mut self,
        step: &mut Step<'_>,
        _prim: BaseType,
        value: TrackedValue,
    ) -> Result<TrackedValue> {
        self.record_use(step.pos(), 0, &value);
        Ok(self.stack_post(step.pos()))
    }
}

/// The completed value-flow analysis of one method.
pub struct ValueFlowAnalysis {
    analyzer: Analyzer<FrameDomain<Boxed<ValueFlowSemantics>>>,
    table: SourceTable,
    uses: FxHashMap<UseIndex, SourceSet>,
    use_virtuals: FxHashMap<UseIndex, SourceId>,
    uses_of: FxHashMap<SourceId, Vec<UseIndex>>,
    init_points: FxHashMap<u32, SourceId>,
    representative: Vec<SourceId>,
}

impl ValueFlowAnalysis {
    /// Runs the value-flow pass, sharing the type analysis's control flow.
    ///
    /// # Errors
    ///
    /// Propagates analysis failures.
    pub fn run(body: &MethodBody, types: &TypeAnalysis) -> Result<Self> {
        let mut analyzer = Analyzer::child_of(types.analyzer());
        let mut domain = FrameDomain::new(Boxed::new(ValueFlowSemantics::new()));
        analyzer.run(body, &mut domain)?;
        let mut semantics = domain.into_inner().into_inner();

        let mut uses_of: FxHashMap<SourceId, Vec<UseIndex>> = FxHashMap::default();
        for (&use_index, sources) in &semantics.uses {
            for &source in sources {
                uses_of.entry(source).or_default().push(use_index);
            }
        }
        for list in uses_of.values_mut() {
            list.sort_unstable_by_key(|u| (u.at, u.operand));
        }

        let representative = (0..semantics.table.len() as SourceId)
            .map(|id| semantics.partition.find(id))
            .collect();

        Ok(ValueFlowAnalysis {
            analyzer,
            table: std::mem::take(&mut semantics.table),
            uses: std::mem::take(&mut semantics.uses),
            use_virtuals: std::mem::take(&mut semantics.use_virtuals),
            uses_of,
            init_points: std::mem::take(&mut semantics.init_points),
            representative,
        })
    }

    /// Tracked frame flowing into `pos`.
    #[must_use]
    pub fn frame_at(&self, pos: u32) -> Option<&Frame<TrackedValue>> {
        self.analyzer.in_state(pos)
    }

    /// Sources that may reach the given use.
    #[must_use]
    pub fn sources_of(&self, use_index: UseIndex) -> Option<&[SourceId]> {
        self.uses.get(&use_index).map(SmallVec::as_slice)
    }

    /// Uses that may observe the given source.
    #[must_use]
    pub fn uses_of(&self, source: SourceId) -> &[UseIndex] {
        self.uses_of.get(&source).map_or(&[], Vec::as_slice)
    }

    /// Virtual source observed by the given use. Unlike [`Self::sources_of`]
    /// this reflects merge identities, so a use downstream of a join reports
    /// the synthetic merge source rather than the contributing originals.
    #[must_use]
    pub fn virtual_source_of(&self, use_index: UseIndex) -> Option<SourceId> {
        self.use_virtuals.get(&use_index).copied()
    }

    /// The interning table.
    #[must_use]
    pub fn sources(&self) -> &SourceTable {
        &self.table
    }

    /// Representative of the source's merge-equivalence class.
    #[must_use]
    pub fn representative(&self, source: SourceId) -> SourceId {
        self.representative
            .get(source as usize)
            .copied()
            .unwrap_or(source)
    }

    /// Returns `true` if two sources ever co-occurred in one merged value.
    #[must_use]
    pub fn same_class(&self, a: SourceId, b: SourceId) -> bool {
        self.representative(a) == self.representative(b)
    }

    /// Virtual source initialized by the `<init>` call at `pos`.
    #[must_use]
    pub fn initialization_at(&self, pos: u32) -> Option<SourceId> {
        self.init_points.get(&pos).copied()
    }

    /// All recorded initialization points.
    pub fn initialization_points(&self) -> impl Iterator<Item = (u32, SourceId)> + '_ {
        self.init_points.iter().map(|(&pos, &id)| (pos, id))
    }

    /// All recorded uses.
    pub fn all_uses(&self) -> impl Iterator<Item = (UseIndex, &[SourceId])> + '_ {
        self.uses.iter().map(|(&u, s)| (u, s.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{opcode as op, MethodBuilder, MethodFlags};

    fn analyze(body: &MethodBody) -> ValueFlowAnalysis {
        let types = TypeAnalysis::run(body).unwrap();
        ValueFlowAnalysis::run(body, &types).unwrap()
    }

    #[test]
    fn tracks_straight_line_flow() {
        let body = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC)
            .unwrap()
            .op(op::ILOAD_0)
            .op(op::ICONST_1)
            .op(op::IADD)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let vf = analyze(&body);
        // iadd at 2 consumes the parameter and the literal.
        let lhs = vf.sources_of(UseIndex { at: 2, operand: 0 }).unwrap();
        let rhs = vf.sources_of(UseIndex { at: 2, operand: 1 }).unwrap();
        assert_eq!(
            vf.sources().index_of(lhs[0]),
            &SourceIndex::Entry { slot: 0 }
        );
        assert_eq!(
            vf.sources().index_of(rhs[0]),
            &SourceIndex::StackPost { at: 1 }
        );
        // The literal's use set points back at the add.
        assert_eq!(vf.uses_of(rhs[0]), &[UseIndex { at: 2, operand: 1 }]);
    }

    #[test]
    fn every_reachable_use_has_a_producer() {
        let mut b = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC).unwrap();
        let other = b.label();
        let join = b.label();
        let body = b
            .op(op::ILOAD_0)
            .branch(op::IFEQ, other)
            .op(op::ICONST_1)
            .branch(op::GOTO, join)
            .bind(other)
            .op(op::ICONST_0)
            .bind(join)
            .op(op::IRETURN)
            .build()
            .unwrap();
        let vf = analyze(&body);
        for (use_index, sources) in vf.all_uses() {
            assert!(
                !sources.is_empty(),
                "use {use_index:?} has no producers"
            );
        }
        // The return merges both arms.
        let ret_sources = vf.sources_of(UseIndex { at: 9, operand: 0 }).unwrap();
        assert_eq!(ret_sources.len(), 2);
        assert!(vf.same_class(ret_sources[0], ret_sources[1]));
    }

    #[test]
    fn merge_coalescing_shares_one_virtual_source() {
        // Two locals merging the same pair of origins at one position must
        // receive one shared synthetic identity, not two.
        let mut semantics = ValueFlowSemantics::new();
        let a = semantics.fresh(SourceIndex::StackPost { at: 4 }, InitStatus::Initialized);
        let b = semantics.fresh(SourceIndex::StackPost { at: 13 }, InitStatus::Initialized);

        let merged_slot0 = semantics.merge_values(19, &a, &b).unwrap();
        let merged_slot1 = semantics.merge_values(19, &a, &b).unwrap();
        assert_eq!(merged_slot0.virtual_source, merged_slot1.virtual_source);
        assert!(matches!(
            semantics.table.index_of(merged_slot0.virtual_source),
            SourceIndex::Merge { at: 19, ordinal: 0 }
        ));

        // A different pair at the same position gets its own identity.
        let c = semantics.fresh(SourceIndex::StackPost { at: 21 }, InitStatus::Initialized);
        let merged_other = semantics.merge_values(19, &a, &c).unwrap();
        assert_ne!(merged_other.virtual_source, merged_slot0.virtual_source);

        // And a different position never coalesces with 19.
        let merged_elsewhere = semantics.merge_values(30, &a, &b).unwrap();
        assert_ne!(merged_elsewhere.virtual_source, merged_slot0.virtual_source);
    }

    #[test]
    fn constructor_initialization_is_recorded_once() {
        let b = MethodBuilder::new("t/T", "<init>", "()V", MethodFlags::empty()).unwrap();
        let body = b
            .op(op::ALOAD_0) // 0
            .pool_op(
                op::INVOKESPECIAL,
                crate::bytecode::PoolEntry::Method(MethodRef {
                    class: ClassRef::new("java/lang/Object"),
                    name: std::sync::Arc::from("<init>"),
                    descriptor: crate::bytecode::MethodDescriptor::parse("()V").unwrap(),
                }),
            ) // 1
            .op(op::RETURN) // 4
            .build()
            .unwrap();
        let vf = analyze(&body);
        let init_source = vf.initialization_at(1).expect("init point recorded");
        assert_eq!(
            vf.sources().index_of(init_source),
            &SourceIndex::Entry { slot: 0 }
        );
        // After the call, local 0 is initialized.
        let frame = vf.frame_at(4).unwrap();
        let receiver = frame.local(0).unwrap().value().unwrap();
        assert_eq!(receiver.init, InitStatus::Initialized);
    }
}

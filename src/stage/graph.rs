//! The stage graph: control and data edges over nodes of interest.
//!
//! The graph is the hand-off between the discovery/selection passes and the
//! weave analysis. Its invariant: by the time it is handed over, every
//! staged source's argument uses and every interesting node's in/out
//! control edges are fully resolved — a partial graph is a logic error, not
//! a recoverable state.

use std::fmt::Write as _;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    analysis::{SourceId, UseIndex},
    stage::node::{NodeArena, NodeRef, SourceNode, UseNode},
};

/// The assembled stage graph of one method.
#[derive(Debug, Default)]
pub struct StageGraph {
    pub(crate) arena: NodeArena,
    pub(crate) interesting_sources: FxHashSet<SourceId>,
    pub(crate) interesting_uses: FxHashSet<UseIndex>,
    control_out: FxHashMap<NodeRef, Vec<NodeRef>>,
    control_in: FxHashMap<NodeRef, Vec<NodeRef>>,
    data_out: FxHashMap<SourceId, Vec<UseIndex>>,
    data_in: FxHashMap<UseIndex, Vec<SourceId>>,
}

impl StageGraph {
    /// The source node for `id`, if discovered.
    #[must_use]
    pub fn source(&self, id: SourceId) -> Option<&SourceNode> {
        self.arena.sources.get(&id)
    }

    /// The use node for `index`, if discovered.
    #[must_use]
    pub fn use_node(&self, index: UseIndex) -> Option<&UseNode> {
        self.arena.uses.get(&index)
    }

    /// All staged source nodes, in ascending id order.
    pub fn staged_sources(&self) -> impl Iterator<Item = &SourceNode> {
        let mut ids: Vec<_> = self
            .arena
            .sources
            .values()
            .filter(|n| n.staged().is_some())
            .collect();
        ids.sort_by_key(|n| n.id);
        ids.into_iter()
    }

    /// Returns `true` if the node survived interest filtering.
    #[must_use]
    pub fn is_interesting(&self, node: NodeRef) -> bool {
        match node {
            NodeRef::Entry | NodeRef::Exit => true,
            NodeRef::Source(id) => self.interesting_sources.contains(&id),
            NodeRef::Use(at, operand) => {
                self.interesting_uses.contains(&UseIndex { at, operand })
            }
        }
    }

    /// Registers a control edge; duplicates collapse.
    pub(crate) fn add_control(&mut self, from: NodeRef, to: NodeRef) {
        let out = self.control_out.entry(from).or_default();
        if !out.contains(&to) {
            out.push(to);
            self.control_in.entry(to).or_default().push(from);
        }
    }

    /// Registers a data edge; duplicates collapse.
    pub(crate) fn add_data(&mut self, source: SourceId, use_index: UseIndex) {
        let out = self.data_out.entry(source).or_default();
        if !out.contains(&use_index) {
            out.push(use_index);
            self.data_in.entry(use_index).or_default().push(source);
        }
    }

    /// Control successors of `node`.
    #[must_use]
    pub fn control_out(&self, node: NodeRef) -> &[NodeRef] {
        self.control_out.get(&node).map_or(&[], Vec::as_slice)
    }

    /// Control predecessors of `node`.
    #[must_use]
    pub fn control_in(&self, node: NodeRef) -> &[NodeRef] {
        self.control_in.get(&node).map_or(&[], Vec::as_slice)
    }

    /// Data edges out of a source.
    #[must_use]
    pub fn data_out(&self, source: SourceId) -> &[UseIndex] {
        self.data_out.get(&source).map_or(&[], Vec::as_slice)
    }

    /// Data edges into a use.
    #[must_use]
    pub fn data_in(&self, use_index: UseIndex) -> &[SourceId] {
        self.data_in.get(&use_index).map_or(&[], Vec::as_slice)
    }

    /// Returns `true` if `node` is reachable from the entry sentinel along
    /// control edges.
    #[must_use]
    pub fn reaches_from_entry(&self, node: NodeRef) -> bool {
        let mut seen = FxHashSet::default();
        let mut stack = vec![NodeRef::Entry];
        while let Some(current) = stack.pop() {
            if current == node {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.extend(self.control_out(current));
        }
        false
    }

    /// Renders the graph in Graphviz dot format, for debugging dumps.
    #[must_use]
    pub fn to_dot(&self) -> String {
        fn name(node: NodeRef) -> String {
            match node {
                NodeRef::Entry => "entry".into(),
                NodeRef::Exit => "exit".into(),
                NodeRef::Source(id) => format!("src_{id}"),
                NodeRef::Use(at, operand) => format!("use_{at}_{operand}"),
            }
        }
        let mut out = String::from("digraph stage {\n");
        for (from, tos) in &self.control_out {
            for to in tos {
                let _ = writeln!(out, "  {} -> {};", name(*from), name(*to));
            }
        }
        for (source, uses) in &self.data_out {
            for u in uses {
                let _ = writeln!(
                    out,
                    "  {} -> {} [style=dashed];",
                    name(NodeRef::Source(*source)),
                    name(NodeRef::of_use(*u))
                );
            }
        }
        out.push_str("}\n");
        out
    }
}

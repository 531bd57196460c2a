//! Stage-graph nodes: sources, uses and the arena holding them.
//!
//! Nodes are indexed by the value-flow identities ([`SourceId`] /
//! [`UseIndex`]) rather than by reference, and edges live in side tables as
//! id pairs, so the graph is acyclic in memory no matter how cyclic the
//! program is.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{
    analysis::{InvokeKind, SourceId, UseIndex},
    bytecode::{FieldRef, MemberId, MethodRef},
    stage::policy::{Language, LanguageSet},
};

/// The staged operation behind a [`SourceKind::Staged`] node.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    /// A staged field read (`getstatic`/`getfield`).
    FieldRead(FieldRef),
    /// A staged field write (`putstatic`/`putfield`).
    FieldWrite(FieldRef),
    /// A staged method invocation.
    Call(MethodRef, InvokeKind),
}

impl StagedOp {
    /// Stable identifier of the staged member.
    #[must_use]
    pub fn member_id(&self) -> MemberId {
        match self {
            StagedOp::FieldRead(f) | StagedOp::FieldWrite(f) => f.member_id(),
            StagedOp::Call(m, _) => m.member_id(),
        }
    }
}

/// A staged site: the annotated member plus its resolved argument uses.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedSite {
    /// The staged operation.
    pub op: StagedOp,
    /// Language tag from the annotation lookup.
    pub language: Language,
    /// Strict sites evaluate immediately after construction.
    pub strict: bool,
    /// Opaque static-info elements for the code-emission service.
    pub static_info: Vec<Arc<str>>,
    /// Argument uses in evaluation order (receiver first when present).
    pub args: Vec<UseIndex>,
}

/// Role of a source node.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// An ordinary value producer.
    Opaque,
    /// An annotated staging boundary.
    Staged(Box<StagedSite>),
}

/// A discovered source node.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceNode {
    /// Value-flow identity.
    pub id: SourceId,
    /// Producing position, when the source is tied to an instruction.
    pub pos: Option<u32>,
    /// Role.
    pub kind: SourceKind,
}

impl SourceNode {
    /// The staged site, if this node is staged.
    #[must_use]
    pub fn staged(&self) -> Option<&StagedSite> {
        match &self.kind {
            SourceKind::Staged(site) => Some(site),
            SourceKind::Opaque => None,
        }
    }
}

/// Role of a use node.
#[derive(Debug, Clone, PartialEq)]
pub enum UseKind {
    /// An ordinary consumer.
    Opaque,
    /// An argument of a staged site.
    Argument {
        /// The staged source this argument belongs to.
        of: SourceId,
        /// Argument position (receiver is 0).
        position: u16,
        /// Languages accepted without materialization.
        accepts: LanguageSet,
    },
}

/// A discovered use node.
#[derive(Debug, Clone, PartialEq)]
pub struct UseNode {
    /// Consuming position and operand.
    pub index: UseIndex,
    /// Role.
    pub kind: UseKind,
}

/// Reference to any node, including the synthetic boundary sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    /// Method entry sentinel.
    Entry,
    /// Method exit sentinel.
    Exit,
    /// A source node.
    Source(SourceId),
    /// A use node.
    Use(u32, u16),
}

impl NodeRef {
    /// Wraps a use index.
    #[must_use]
    pub fn of_use(index: UseIndex) -> Self {
        NodeRef::Use(index.at, index.operand)
    }

    /// Unwraps a use reference.
    #[must_use]
    pub fn as_use(&self) -> Option<UseIndex> {
        match self {
            NodeRef::Use(at, operand) => Some(UseIndex {
                at: *at,
                operand: *operand,
            }),
            _ => None,
        }
    }
}

/// The arena of discovered nodes.
#[derive(Debug, Default)]
pub struct NodeArena {
    /// Sources by value-flow id.
    pub sources: FxHashMap<SourceId, SourceNode>,
    /// Uses by consuming index.
    pub uses: FxHashMap<UseIndex, UseNode>,
}

impl NodeArena {
    /// Registers a source, keeping an existing staged registration.
    pub fn add_source(&mut self, node: SourceNode) {
        self.sources
            .entry(node.id)
            .and_modify(|existing| {
                if matches!(existing.kind, SourceKind::Opaque)
                    && !matches!(node.kind, SourceKind::Opaque)
                {
                    *existing = node.clone();
                }
            })
            .or_insert(node);
    }

    /// Registers a use, keeping an existing argument registration.
    pub fn add_use(&mut self, node: UseNode) {
        self.uses
            .entry(node.index)
            .and_modify(|existing| {
                if matches!(existing.kind, UseKind::Opaque)
                    && !matches!(node.kind, UseKind::Opaque)
                {
                    *existing = node.clone();
                }
            })
            .or_insert(node);
    }
}

//! The external staging-annotation boundary.
//!
//! The core never parses annotations itself; everything it needs from the
//! configuration side is behind [`StagePolicy`]: is a member a staging
//! boundary, which languages an argument position accepts without
//! materialization, is a language suppressed in a lexical context, and how
//! cacheable a staged site is.
//!
//! Lookups are pure functions of static program structure, so
//! [`CachedPolicy`] memoizes them for the duration of one pipeline run,
//! keyed by stable [`MemberId`]s rather than object identity.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::bytecode::MemberId;

/// An interned staging-language tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Language(Arc<str>);

impl Language {
    /// Creates a language tag.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Language(name.into())
    }

    /// The tag text.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A small set of language tags.
pub type LanguageSet = SmallVec<[Language; 2]>;

/// Configuration of one staged member.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInfo {
    /// The staging language this member belongs to.
    pub language: Language,
    /// Strict sites evaluate immediately; the rewrite materializes the
    /// carrier right after constructing it.
    pub strict: bool,
    /// Opaque static-info elements forwarded to the code-emission service.
    pub static_info: Vec<Arc<str>>,
}

/// External caching policy for a staged site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cachability {
    /// One static holder field, reused forever.
    Permanent,
    /// Bounded cache keyed by a runtime path trace.
    Trace,
    /// Always recompute.
    None,
}

/// The lookup surface the staging layers consume.
pub trait StagePolicy {
    /// Staging configuration of `member`, or `None` for ordinary members.
    fn stage_info(&self, member: &MemberId) -> Option<StageInfo>;

    /// Languages the argument at `index` of `member` accepts as carriers
    /// without materialization. Index 0 is the receiver of instance
    /// members.
    fn accept_info(&self, member: &MemberId, index: u16) -> LanguageSet;

    /// Whether staging for `language` is disabled inside `context`.
    fn is_suppressed(&self, context: &MemberId, language: &Language) -> bool;

    /// External caching decision for a staged member.
    fn cachability(&self, member: &MemberId) -> Cachability;
}

/// Read-through memoization of a [`StagePolicy`], owned by one pipeline run.
pub struct CachedPolicy<P> {
    inner: P,
    stage_info: RefCell<FxHashMap<MemberId, Option<StageInfo>>>,
    accepts: RefCell<FxHashMap<(MemberId, u16), LanguageSet>>,
}

impl<P: StagePolicy> CachedPolicy<P> {
    /// Wraps a policy.
    pub fn new(inner: P) -> Self {
        CachedPolicy {
            inner,
            stage_info: RefCell::new(FxHashMap::default()),
            accepts: RefCell::new(FxHashMap::default()),
        }
    }
}

impl<P: StagePolicy> StagePolicy for CachedPolicy<P> {
    fn stage_info(&self, member: &MemberId) -> Option<StageInfo> {
        if let Some(cached) = self.stage_info.borrow().get(member) {
            return cached.clone();
        }
        let info = self.inner.stage_info(member);
        self.stage_info
            .borrow_mut()
            .insert(member.clone(), info.clone());
        info
    }

    fn accept_info(&self, member: &MemberId, index: u16) -> LanguageSet {
        let key = (member.clone(), index);
        if let Some(cached) = self.accepts.borrow().get(&key) {
            return cached.clone();
        }
        let accepts = self.inner.accept_info(member, index);
        self.accepts.borrow_mut().insert(key, accepts.clone());
        accepts
    }

    fn is_suppressed(&self, context: &MemberId, language: &Language) -> bool {
        self.inner.is_suppressed(context, language)
    }

    fn cachability(&self, member: &MemberId) -> Cachability {
        self.inner.cachability(member)
    }
}

/// Map-backed policy for embedders and tests.
#[derive(Default)]
pub struct TablePolicy {
    staged: FxHashMap<MemberId, StageInfo>,
    accepts: FxHashMap<(MemberId, u16), LanguageSet>,
    suppressed: FxHashMap<MemberId, Vec<Language>>,
    cachability: FxHashMap<MemberId, Cachability>,
}

impl TablePolicy {
    /// Creates an empty policy: nothing is staged.
    #[must_use]
    pub fn new() -> Self {
        TablePolicy::default()
    }

    /// Registers `member` as staged.
    pub fn stage(&mut self, member: MemberId, info: StageInfo) -> &mut Self {
        self.staged.insert(member, info);
        self
    }

    /// Declares that argument `index` of `member` accepts `languages`.
    pub fn accept(&mut self, member: MemberId, index: u16, languages: LanguageSet) -> &mut Self {
        self.accepts.insert((member, index), languages);
        self
    }

    /// Suppresses `language` inside `context`.
    pub fn suppress(&mut self, context: MemberId, language: Language) -> &mut Self {
        self.suppressed.entry(context).or_default().push(language);
        self
    }

    /// Sets the caching decision for `member`.
    pub fn cache(&mut self, member: MemberId, cachability: Cachability) -> &mut Self {
        self.cachability.insert(member, cachability);
        self
    }
}

impl StagePolicy for TablePolicy {
    fn stage_info(&self, member: &MemberId) -> Option<StageInfo> {
        self.staged.get(member).cloned()
    }

    fn accept_info(&self, member: &MemberId, index: u16) -> LanguageSet {
        self.accepts
            .get(&(member.clone(), index))
            .cloned()
            .unwrap_or_default()
    }

    fn is_suppressed(&self, context: &MemberId, language: &Language) -> bool {
        self.suppressed
            .get(context)
            .is_some_and(|langs| langs.contains(language))
    }

    fn cachability(&self, member: &MemberId) -> Cachability {
        self.cachability
            .get(member)
            .copied()
            .unwrap_or(Cachability::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> MemberId {
        MemberId::new("demo/Lang", name, "I")
    }

    #[test]
    fn table_policy_round_trip() {
        let mut policy = TablePolicy::new();
        policy.stage(
            member("staged"),
            StageInfo {
                language: Language::new("sql"),
                strict: true,
                static_info: vec![],
            },
        );
        policy.suppress(member("host"), Language::new("sql"));

        assert!(policy.stage_info(&member("staged")).is_some());
        assert!(policy.stage_info(&member("plain")).is_none());
        assert!(policy.is_suppressed(&member("host"), &Language::new("sql")));
        assert!(!policy.is_suppressed(&member("host"), &Language::new("regex")));
        assert_eq!(policy.cachability(&member("staged")), Cachability::None);
    }

    /// Counts raw lookups to show the cache reads through once.
    struct Counting {
        inner: TablePolicy,
        lookups: std::cell::Cell<usize>,
    }

    impl StagePolicy for Counting {
        fn stage_info(&self, member: &MemberId) -> Option<StageInfo> {
            self.lookups.set(self.lookups.get() + 1);
            self.inner.stage_info(member)
        }
        fn accept_info(&self, member: &MemberId, index: u16) -> LanguageSet {
            self.inner.accept_info(member, index)
        }
        fn is_suppressed(&self, context: &MemberId, language: &Language) -> bool {
            self.inner.is_suppressed(context, language)
        }
        fn cachability(&self, member: &MemberId) -> Cachability {
            self.inner.cachability(member)
        }
    }

    #[test]
    fn cached_policy_memoizes_stage_info() {
        let counting = Counting {
            inner: TablePolicy::new(),
            lookups: std::cell::Cell::new(0),
        };
        let cached = CachedPolicy::new(counting);
        for _ in 0..3 {
            assert!(cached.stage_info(&member("x")).is_none());
        }
        assert_eq!(cached.inner.lookups.get(), 1);
    }
}

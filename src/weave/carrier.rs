//! The carrier-type lattice driving the weave decisions.
//!
//! Every stack and local slot is classified by whether it holds a concrete
//! value or a lazy-expression *carrier* object. Local carriers are scoped to
//! one evaluation; global carriers may cross method boundaries. The merge
//! table is total and explicit: any unresolved ambiguity degrades toward the
//! conservative `Maybe` side, and a join of a global and a local carrier
//! always lands on [`WeaveType::MaybeLocallyCarrying`], since global
//! carriers cannot be assumed identical to local ones past a join.

/// Carrier classification of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
pub enum WeaveType {
    /// Definitely a concrete value.
    NotCarrying,
    /// May hold a local carrier, may hold a concrete value.
    MaybeLocallyCarrying,
    /// May hold a global carrier, may hold a concrete value.
    MaybeGloballyCarrying,
    /// Definitely a local carrier.
    LocallyCarrying,
    /// Definitely a global carrier.
    GloballyCarrying,
}

impl WeaveType {
    /// Joins two classifications flowing together at a merge point.
    #[must_use]
    pub fn merge(self, other: WeaveType) -> WeaveType {
        use WeaveType::{
            GloballyCarrying as G, LocallyCarrying as L, MaybeGloballyCarrying as MG,
            MaybeLocallyCarrying as ML, NotCarrying as N,
        };
        match (self, other) {
            (N, N) => N,
            (N, ML) | (ML, N) => ML,
            (N, MG) | (MG, N) => MG,
            (N, L) | (L, N) => ML,
            (N, G) | (G, N) => MG,
            (ML, ML) => ML,
            (ML, MG) | (MG, ML) => ML,
            (ML, L) | (L, ML) => ML,
            (ML, G) | (G, ML) => ML,
            (MG, MG) => MG,
            (MG, L) | (L, MG) => ML,
            (MG, G) | (G, MG) => MG,
            (L, L) => L,
            (L, G) | (G, L) => ML,
            (G, G) => G,
        }
    }

    /// Returns `true` if the slot can hold a carrier at all.
    #[must_use]
    pub fn may_carry(self) -> bool {
        !matches!(self, WeaveType::NotCarrying)
    }

    /// Returns `true` if the slot definitely holds a carrier.
    #[must_use]
    pub fn carries(self) -> bool {
        matches!(
            self,
            WeaveType::LocallyCarrying | WeaveType::GloballyCarrying
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn merge_is_total_and_commutative() {
        for a in WeaveType::iter() {
            for b in WeaveType::iter() {
                assert_eq!(a.merge(b), b.merge(a), "merge({a:?}, {b:?})");
            }
        }
    }

    #[test]
    fn merge_is_idempotent() {
        for a in WeaveType::iter() {
            assert_eq!(a.merge(a), a);
        }
    }

    #[test]
    fn global_and_local_degrade_to_maybe_locally() {
        assert_eq!(
            WeaveType::GloballyCarrying.merge(WeaveType::LocallyCarrying),
            WeaveType::MaybeLocallyCarrying
        );
        assert_eq!(
            WeaveType::MaybeGloballyCarrying.merge(WeaveType::LocallyCarrying),
            WeaveType::MaybeLocallyCarrying
        );
    }

    #[test]
    fn concrete_against_carrier_is_maybe() {
        assert_eq!(
            WeaveType::NotCarrying.merge(WeaveType::LocallyCarrying),
            WeaveType::MaybeLocallyCarrying
        );
        assert_eq!(
            WeaveType::NotCarrying.merge(WeaveType::GloballyCarrying),
            WeaveType::MaybeGloballyCarrying
        );
    }

    #[test]
    fn merging_never_resolves_ambiguity() {
        for a in WeaveType::iter() {
            for b in WeaveType::iter() {
                let merged = a.merge(b);
                if a.may_carry() || b.may_carry() {
                    assert!(merged.may_carry(), "merge({a:?}, {b:?}) lost the carrier");
                }
                if a != b {
                    assert!(
                        !merged.carries() || (a.carries() && b.carries()),
                        "merge({a:?}, {b:?}) invented certainty"
                    );
                }
            }
        }
    }
}

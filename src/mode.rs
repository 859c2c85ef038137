//! The Gray-style intent-lock mode algebra.
//!
//! Every function here is a pure predicate over the six modes. None of
//! them hold state or touch the lock table; `LockManager` and
//! `LockContext` are built entirely on top of these.

use std::fmt;

/// One of the six lock modes a transaction can hold on a resource.
///
/// `NL` ("not locked") is the absence of a lock and is never itself stored
/// in a granted set or a `TransactionLocks` index; it only appears as an
/// algebra input/output and as `LockUtil`'s weakest request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Not locked.
    NL,
    /// Intent Shared.
    IS,
    /// Intent Exclusive.
    IX,
    /// Shared.
    S,
    /// Shared with Intent Exclusive.
    SIX,
    /// Exclusive.
    X,
}

impl LockMode {
    /// True iff two different transactions may simultaneously hold `self`
    /// and `other` on the same resource. Symmetric; `compatible(NL, m)` is
    /// always true and `compatible(X, m)` is true only for `m == NL`.
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (NL, _) | (_, NL)
                | (IS, IS) | (IS, IX) | (IS, S) | (IS, SIX)
                | (IX, IS) | (IX, IX)
                | (S, IS) | (S, S)
                | (SIX, IS)
        )
    }

    /// The minimum mode a parent resource must hold for a child to legally
    /// hold `self` beneath it.
    pub fn parent_mode(self) -> LockMode {
        match self {
            LockMode::NL => LockMode::NL,
            LockMode::IS => LockMode::IS,
            LockMode::IX => LockMode::IX,
            LockMode::S => LockMode::IS,
            LockMode::SIX => LockMode::IX,
            LockMode::X => LockMode::IX,
        }
    }

    /// True iff a parent holding mode `self` may have a child holding
    /// mode `child`.
    pub fn can_be_parent_lock(self, child: LockMode) -> bool {
        if child == LockMode::NL {
            return true;
        }
        match self {
            LockMode::IX => true,
            LockMode::SIX => matches!(child, LockMode::IX | LockMode::X),
            _ => self.substitutes(child.parent_mode()),
        }
    }

    /// True iff holding `self` confers every right holding `need` would
    /// confer: `self` may substitute for `need` (the relation that induces
    /// legal promotions). Reflexive.
    pub fn substitutes(self, need: LockMode) -> bool {
        use LockMode::*;
        if self == need {
            return true;
        }
        matches!(
            (self, need),
            (X, S) | (SIX, S) | (IX, IS)
        )
    }

    /// True iff this mode is one of the three intent modes.
    pub fn is_intent(self) -> bool {
        matches!(self, LockMode::IS | LockMode::IX | LockMode::SIX)
    }

    /// A total order over the six modes, used only to break ties between
    /// candidates `substitutes` leaves incomparable (e.g. combining an
    /// intent mode with an ancestor's descendant-projection).
    pub(crate) fn rank(self) -> u8 {
        match self {
            LockMode::NL => 0,
            LockMode::IS => 1,
            LockMode::IX => 2,
            LockMode::S => 3,
            LockMode::SIX => 4,
            LockMode::X => 5,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::NL => "NL",
            LockMode::IS => "IS",
            LockMode::IX => "IX",
            LockMode::S => "S",
            LockMode::SIX => "SIX",
            LockMode::X => "X",
        };
        f.write_str(s)
    }
}

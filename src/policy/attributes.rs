//! The out-of-band attribute byte every object slot carries.
//!
//! ```text
//!  7      4   3       2          1      0
//! +--------+-------+----------+------+-----------+
//! |  kind  | TRACK | FINALIZE | LEAF | ALLOCATED |
//! +--------+-------+----------+------+-----------+
//! ```

use std::ops::BitOr;

use crate::vm::ObjectKind;

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ObjectAttributes(u8);

impl ObjectAttributes {
    pub const NONE: ObjectAttributes = ObjectAttributes(0);
    /// Set on every slot that holds an object. Hosts never pass it.
    pub(crate) const ALLOCATED: ObjectAttributes = ObjectAttributes(1 << 0);
    /// The object holds no references and is never traced.
    pub const LEAF: ObjectAttributes = ObjectAttributes(1 << 1);
    /// The object's kind has finalize and dispose callbacks.
    pub const FINALIZE: ObjectAttributes = ObjectAttributes(1 << 2);
    /// The object is traced only after the rest of the mark stack is drained.
    pub const TRACK: ObjectAttributes = ObjectAttributes(1 << 3);

    const FLAG_MASK: u8 = 0x0f;
    const KIND_SHIFT: u8 = 4;

    pub const fn with_kind(self, kind: ObjectKind) -> Self {
        ObjectAttributes((self.0 & Self::FLAG_MASK) | ((kind.index() as u8) << Self::KIND_SHIFT))
    }

    pub const fn kind(self) -> ObjectKind {
        ObjectKind::from_bits(self.0 >> Self::KIND_SHIFT)
    }

    pub const fn contains(self, other: ObjectAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_allocated(self) -> bool {
        self.contains(Self::ALLOCATED)
    }

    pub const fn is_leaf(self) -> bool {
        self.contains(Self::LEAF)
    }

    pub const fn is_finalizable(self) -> bool {
        self.contains(Self::FINALIZE)
    }

    pub const fn is_tracked(self) -> bool {
        self.contains(Self::TRACK)
    }

    pub(crate) const fn allocated(self) -> Self {
        ObjectAttributes(self.0 | Self::ALLOCATED.0)
    }

    /// What a host may pass: everything but the internal bits.
    pub(crate) const fn sanitized(self) -> Self {
        ObjectAttributes(self.0 & !Self::ALLOCATED.0)
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Self {
        ObjectAttributes(bits)
    }
}

impl BitOr for ObjectAttributes {
    type Output = ObjectAttributes;

    fn bitor(self, rhs: Self) -> Self {
        ObjectAttributes(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for ObjectAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectAttributes(")?;
        for (flag, name) in [
            (Self::ALLOCATED, "A"),
            (Self::LEAF, "L"),
            (Self::FINALIZE, "F"),
            (Self::TRACK, "T"),
        ] {
            if self.contains(flag) {
                write!(f, "{}", name)?;
            }
        }
        write!(f, ", kind {})", self.kind().index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ObjectKindInfo, ObjectKindTable};

    #[test]
    fn kind_round_trips_through_the_high_bits() {
        let mut table = ObjectKindTable::new();
        let mut kind = ObjectKind::CONSERVATIVE;
        for _ in 0..5 {
            kind = table.register(ObjectKindInfo::conservative("k")).unwrap();
        }
        let attrs = (ObjectAttributes::FINALIZE | ObjectAttributes::TRACK).with_kind(kind);
        assert_eq!(attrs.kind(), kind);
        assert!(attrs.is_finalizable());
        assert!(attrs.is_tracked());
        assert!(!attrs.is_leaf());
        assert!(!attrs.is_allocated());
        assert!(attrs.allocated().is_allocated());
        assert_eq!(attrs.allocated().sanitized(), attrs);
    }
}

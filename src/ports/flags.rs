//! Bind flags and their reference accounting.

use bitflags::bitflags;

/// Port-sharing options requested by a binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags {
    /// Deliver to the most recently bound endpoint (SO_REUSEADDR).
    pub most_recent: bool,
    /// Spread deliveries across endpoints by flow hash (SO_REUSEPORT).
    pub load_balanced: bool,
    /// The binding is told apart by its full 4-tuple.
    pub tuple_only: bool,
}

impl Flags {
    pub fn bits(&self) -> BitFlags {
        let mut b = BitFlags::empty();
        b.set(BitFlags::MOST_RECENT, self.most_recent);
        b.set(BitFlags::LOAD_BALANCED, self.load_balanced);
        b.set(BitFlags::TUPLE_ONLY, self.tuple_only);
        b
    }
}

bitflags! {
    /// Packed form of [`Flags`], used as an index into [`FlagCounter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BitFlags: u8 {
        const MOST_RECENT = 1 << 0;
        const LOAD_BALANCED = 1 << 1;
        const TUPLE_ONLY = 1 << 2;

        /// Flags that allow several endpoints on one address and port.
        const MULTI_BIND_MASK = Self::MOST_RECENT.bits() | Self::LOAD_BALANCED.bits();
    }
}

impl BitFlags {
    pub fn to_flags(self) -> Flags {
        Flags {
            most_recent: self.contains(Self::MOST_RECENT),
            load_balanced: self.contains(Self::LOAD_BALANCED),
            tuple_only: self.contains(Self::TUPLE_ONLY),
        }
    }
}

/// One past the largest flag combination.
const NEXT_FLAG: usize = 1 << 3;

/// Reference counts per flag combination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagCounter {
    refs: [u32; NEXT_FLAG],
}

impl FlagCounter {
    pub fn add_ref(&mut self, flags: BitFlags) {
        self.refs[flags.bits() as usize] += 1;
    }

    pub fn drop_ref(&mut self, flags: BitFlags) {
        let slot = &mut self.refs[flags.bits() as usize];
        debug_assert!(*slot > 0, "dropping unreferenced flag combination");
        *slot = slot.saturating_sub(1);
    }

    pub fn total_refs(&self) -> u32 {
        self.refs.iter().sum()
    }

    /// References whose flags include all of `flags`.
    pub fn flag_refs(&self, flags: BitFlags) -> u32 {
        self.refs
            .iter()
            .enumerate()
            .filter(|(i, _)| BitFlags::from_bits_truncate(*i as u8).contains(flags))
            .map(|(_, n)| n)
            .sum()
    }

    /// Flags set by every current reference.
    pub fn intersection_refs(&self) -> BitFlags {
        let mut intersection = BitFlags::all();
        for (i, &n) in self.refs.iter().enumerate() {
            if n > 0 {
                intersection &= BitFlags::from_bits_truncate(i as u8);
            }
        }
        intersection
    }

    /// Multi-bind flags every current reference agrees on.
    pub fn shared_flags(&self) -> BitFlags {
        self.intersection_refs() & BitFlags::MULTI_BIND_MASK
    }

    /// Whether a new reference with `flags` may join.
    ///
    /// Joining is allowed when nothing is referenced, when the newcomer
    /// shares a multi-bind flag with every existing reference, or when all
    /// parties are tuple-only.
    pub fn accepts(&self, flags: BitFlags) -> bool {
        if self.total_refs() == 0 {
            return true;
        }
        if !(self.shared_flags() & flags).is_empty() {
            return true;
        }
        flags.contains(BitFlags::TUPLE_ONLY)
            && self.intersection_refs().contains(BitFlags::TUPLE_ONLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reuse_port() -> BitFlags {
        Flags {
            load_balanced: true,
            ..Default::default()
        }
        .bits()
    }

    #[test]
    fn test_flags_round_trip_bits() {
        let f = Flags {
            most_recent: true,
            load_balanced: false,
            tuple_only: true,
        };
        assert_eq!(f.bits(), BitFlags::MOST_RECENT | BitFlags::TUPLE_ONLY);
        assert_eq!(f.bits().to_flags(), f);
    }

    #[test]
    fn test_counter_refs() {
        let mut c = FlagCounter::default();
        c.add_ref(reuse_port());
        c.add_ref(reuse_port() | BitFlags::MOST_RECENT);
        assert_eq!(c.total_refs(), 2);
        assert_eq!(c.flag_refs(BitFlags::LOAD_BALANCED), 2);
        assert_eq!(c.flag_refs(BitFlags::MOST_RECENT), 1);
        assert_eq!(c.intersection_refs(), BitFlags::LOAD_BALANCED);
        c.drop_ref(reuse_port());
        c.drop_ref(reuse_port() | BitFlags::MOST_RECENT);
        assert_eq!(c.total_refs(), 0);
        assert_eq!(c.intersection_refs(), BitFlags::all());
    }

    #[test]
    fn test_accepts() {
        let mut c = FlagCounter::default();
        assert!(c.accepts(BitFlags::empty()));

        c.add_ref(BitFlags::empty());
        assert!(!c.accepts(BitFlags::empty()));
        assert!(!c.accepts(reuse_port()));

        let mut shared = FlagCounter::default();
        shared.add_ref(reuse_port());
        assert!(shared.accepts(reuse_port()));
        assert!(!shared.accepts(BitFlags::MOST_RECENT));
    }

    #[test]
    fn test_tuple_only_coexist() {
        let mut c = FlagCounter::default();
        c.add_ref(BitFlags::TUPLE_ONLY);
        assert!(c.accepts(BitFlags::TUPLE_ONLY));
        assert!(!c.accepts(BitFlags::empty()));
    }
}

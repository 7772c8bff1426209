//! Small bit-set newtypes used for error and difference masks.
//!
//! Parsers in this crate report every defect they find at once, so their error types are masks
//! rather than enums. `bitmask!` generates the newtype, its flag constants and the usual set
//! operations, plus a `Display` that lists the names of the set flags.

macro_rules! bitmask {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: $ty:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis struct $name($ty);

        #[allow(dead_code)]
        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: Self = Self($value);
            )*
            const ALL: &'static [(&'static str, $ty)] = &[$((stringify!($flag), $value)),*];

            pub const fn empty() -> Self {
                Self(0)
            }
            pub const fn bits(self) -> $ty {
                self.0
            }
            pub const fn from_bits(bits: $ty) -> Self {
                Self(bits)
            }
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
            pub const fn without(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }
            /// Names of all flags set in this mask, in declaration order
            pub fn names(self) -> impl Iterator<Item = &'static str> {
                Self::ALL
                    .iter()
                    .filter(move |(_, value)| self.0 & value != 0)
                    .map(|(name, _)| *name)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                if self.is_empty() {
                    return write!(f, "none");
                }
                let names: Vec<&str> = self.names().collect();
                write!(f, "{}", names.join(" | "))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    bitmask! {
        struct Sample: u8 {
            const A = 0x01;
            const B = 0x02;
            const C = 0x04;
        }
    }

    #[test]
    fn set_operations() {
        let mut mask = Sample::A | Sample::C;
        assert!(mask.contains(Sample::A));
        assert!(!mask.contains(Sample::A | Sample::B));
        assert!(mask.intersects(Sample::C | Sample::B));
        mask.remove(Sample::A);
        assert_eq!(mask, Sample::C);
        mask.insert(Sample::B);
        assert_eq!(mask.bits(), 0x06);
        assert_eq!(mask.without(Sample::B), Sample::C);
    }

    #[test]
    fn display_lists_names() {
        assert_eq!((Sample::A | Sample::C).to_string(), "A | C");
        assert_eq!(Sample::empty().to_string(), "none");
        assert_eq!(format!("{:?}", Sample::B), "Sample(B)");
    }
}

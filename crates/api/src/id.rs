//! Identifiers used on the wire and between the fetcher and its collaborators.

macro_rules! imp_deref {
    ($i:ty, $t:ty) => {
        impl std::ops::Deref for $i {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! imp_from {
    ($a:ty, $b:ty, $i:ident => $e:expr) => {
        impl From<$b> for $a {
            fn from($i: $b) -> Self {
                $e
            }
        }
    };
}

macro_rules! imp_display {
    ($i:ty) => {
        impl std::fmt::Display for $i {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

/// Key identifying a piece of content (a module image or a data blob).
///
/// This is what the registry maps to a store handle, and what both
/// REQUEST and FRAGMENT messages carry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ContentKey(pub u16);

imp_deref!(ContentKey, u16);
imp_from!(ContentKey, u16, k => ContentKey(k));
imp_display!(ContentKey);

/// Single-hop radio address of a node.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct NodeAddr(pub u16);

imp_deref!(NodeAddr, u16);
imp_from!(NodeAddr, u16, a => NodeAddr(a));
imp_display!(NodeAddr);

impl NodeAddr {
    /// The link-layer broadcast address.
    pub const BROADCAST: NodeAddr = NodeAddr(0xffff);

    /// Is this the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

/// Identifies the local consumer that asked for a fetch, and receives
/// the completion notification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct RequesterId(pub u8);

imp_deref!(RequesterId, u8);
imp_from!(RequesterId, u8, r => RequesterId(r));
imp_display!(RequesterId);

/// Opaque handle of a code object owned by the [crate::code_store::CodeStore].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct StoreHandle(pub u16);

imp_deref!(StoreHandle, u16);
imp_from!(StoreHandle, u16, h => StoreHandle(h));
imp_display!(StoreHandle);

/// Absolute address in program memory.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct CodeAddr(pub u32);

imp_deref!(CodeAddr, u32);
imp_from!(CodeAddr, u32, a => CodeAddr(a));

impl std::fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        assert_eq!("42", ContentKey(42).to_string());
        assert_eq!("65535", NodeAddr::BROADCAST.to_string());
        assert_eq!("0x1f00", CodeAddr(0x1f00).to_string());
    }

    #[test]
    fn broadcast() {
        assert!(NodeAddr(0xffff).is_broadcast());
        assert!(!NodeAddr(3).is_broadcast());
    }
}

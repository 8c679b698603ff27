use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(ConnectionId, "conn");

/// Variable identifier. Unique only within one session.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub i64);

impl VarId {
    /// The session root, always created by backend logic.
    pub const ROOT: VarId = VarId(1);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }

    /// Which side of the protocol owns this id, if any.
    pub fn range(self) -> Option<IdRange> {
        [IdRange::Backend, IdRange::Frontend]
            .into_iter()
            .find(|r| r.contains(self))
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Disjoint id ranges for backend- and frontend-issued variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdRange {
    Backend,
    Frontend,
}

impl IdRange {
    const FRONTEND_START: i64 = 1 << 31;
    const FRONTEND_END: i64 = 1 << 53;

    pub fn contains(self, id: VarId) -> bool {
        match self {
            Self::Backend => id.0 >= 1 && id.0 < Self::FRONTEND_START,
            Self::Frontend => id.0 >= Self::FRONTEND_START && id.0 < Self::FRONTEND_END,
        }
    }

    /// First id handed out by an allocator for this range. The backend
    /// allocator skips the root.
    pub fn first(self) -> VarId {
        match self {
            Self::Backend => VarId(2),
            Self::Frontend => VarId(Self::FRONTEND_START),
        }
    }
}

/// Object reference id carried in `{"obj": id}` tokens. Positive ids belong
/// to a connected backend; negative ids are handed out by the engine.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjId(pub i64);

impl ObjId {
    pub fn is_engine_owned(self) -> bool {
        self.0 < 0
    }
}

impl From<VarId> for ObjId {
    fn from(id: VarId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = ConnectionId::from_raw("api");
        assert_eq!(id.as_str(), "api");
    }

    #[test]
    fn var_id_ranges_are_disjoint() {
        assert_eq!(VarId::ROOT.range(), Some(IdRange::Backend));
        assert_eq!(VarId(2).range(), Some(IdRange::Backend));
        assert_eq!(IdRange::Frontend.first().range(), Some(IdRange::Frontend));
        assert_eq!(VarId(0).range(), None);
        assert_eq!(VarId(-5).range(), None);
        assert!(!IdRange::Backend.contains(IdRange::Frontend.first()));
    }

    #[test]
    fn backend_allocation_skips_root() {
        assert_eq!(IdRange::Backend.first(), VarId(2));
    }

    #[test]
    fn var_id_serializes_as_number() {
        assert_eq!(serde_json::to_string(&VarId(7)).unwrap(), "7");
        let id: ObjId = serde_json::from_str("-3").unwrap();
        assert!(id.is_engine_owned());
    }
}

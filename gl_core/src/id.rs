use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream identifier backed by ULID.
///
/// Sortable by creation time, which keeps log lines and map dumps in a
/// sensible order for free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(ulid::Ulid);

impl Id {
    /// Generate a new ID
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Id {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = Id::new();
        let id_str = id.to_string();
        let parsed: Id = id_str.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_serde() {
        let id = Id::new();
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let a = Id::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Id::new();
        assert!(a < b);
    }
}

use serde::{Deserialize, Serialize};

/// Delivery priority within a flushed batch. Ordering follows declaration
/// order, so sorting ascending puts `High` first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::High => ":high",
            Self::Medium => ":med",
            Self::Low => ":low",
        }
    }
}

/// Split a property key into its base name and priority.
///
/// `"viewdefs:high"` yields `("viewdefs", High)`; a key without a recognized
/// suffix is medium priority.
pub fn split_priority(key: &str) -> (&str, Priority) {
    for priority in Priority::ALL {
        if let Some(base) = key.strip_suffix(priority.suffix()) {
            return (base, priority);
        }
    }
    (key, Priority::Medium)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_suffixes() {
        assert_eq!(split_priority("viewdefs:high"), ("viewdefs", Priority::High));
        assert_eq!(split_priority("name:med"), ("name", Priority::Medium));
        assert_eq!(split_priority("items:low"), ("items", Priority::Low));
    }

    #[test]
    fn defaults_to_medium() {
        assert_eq!(split_priority("type"), ("type", Priority::Medium));
        assert_eq!(split_priority("odd:suffix"), ("odd:suffix", Priority::Medium));
    }

    #[test]
    fn high_sorts_first() {
        let mut ps = vec![Priority::Low, Priority::High, Priority::Medium];
        ps.sort();
        assert_eq!(ps, vec![Priority::High, Priority::Medium, Priority::Low]);
    }
}

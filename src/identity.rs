use std::collections::{BTreeMap, HashMap};

/// Maps free-text employee names onto a single canonical identity.
///
/// Built once from a canonical -> spellings table. Lookup keys are lower-cased
/// and trimmed; names with no alias entry pass through trimmed and act as
/// their own identity.
#[derive(Debug, Clone, Default)]
pub struct NameNormalizer {
    alias_to_canonical: HashMap<String, String>,
}

impl NameNormalizer {
    pub fn new(name_aliases: &BTreeMap<String, Vec<String>>) -> Self {
        let mut alias_to_canonical = HashMap::new();
        for (canonical, aliases) in name_aliases {
            alias_to_canonical.insert(alias_key(canonical), canonical.clone());
            for alias in aliases {
                alias_to_canonical.insert(alias_key(alias), canonical.clone());
            }
        }
        Self { alias_to_canonical }
    }

    /// Returns `None` for absent or blank input.
    pub fn normalize(&self, raw: Option<&str>) -> Option<String> {
        let trimmed = raw?.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(
            self.alias_to_canonical
                .get(&trimmed.to_lowercase())
                .cloned()
                .unwrap_or_else(|| trimmed.to_string()),
        )
    }

    pub fn normalize_str(&self, raw: &str) -> Option<String> {
        self.normalize(Some(raw))
    }

    pub fn alias_count(&self) -> usize {
        self.alias_to_canonical.len()
    }
}

fn alias_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ReconcilerConfig;

    fn normalizer() -> NameNormalizer {
        NameNormalizer::new(&ReconcilerConfig::default().name_aliases)
    }

    #[test]
    fn test_aliases_in_same_group_agree() {
        let n = normalizer();
        for (canonical, spellings) in &ReconcilerConfig::default().name_aliases {
            for spelling in spellings {
                assert_eq!(
                    n.normalize_str(spelling).as_deref(),
                    Some(canonical.as_str()),
                    "{} should map to {}",
                    spelling,
                    canonical
                );
            }
        }
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        let n = normalizer();
        assert_eq!(n.normalize_str("  FILIPE PIRES ").unwrap(), "Pires, Filipe");
        assert_eq!(n.normalize_str("helbing, bjoern").unwrap(), "Helbing, Björn");
    }

    #[test]
    fn test_unknown_name_passes_through_trimmed() {
        let n = normalizer();
        assert_eq!(n.normalize_str("  Jane Doe  ").unwrap(), "Jane Doe");
    }

    #[test]
    fn test_blank_input_is_none() {
        let n = normalizer();
        assert_eq!(n.normalize(None), None);
        assert_eq!(n.normalize_str(""), None);
        assert_eq!(n.normalize_str("   "), None);
    }

    #[test]
    fn test_canonical_name_maps_to_itself_without_explicit_alias() {
        let mut table = BTreeMap::new();
        table.insert("Doe, Jane".to_string(), vec!["Jane Doe".to_string()]);
        let n = NameNormalizer::new(&table);
        assert_eq!(n.normalize_str("doe, jane").unwrap(), "Doe, Jane");
        assert_eq!(n.alias_count(), 2);
    }
}

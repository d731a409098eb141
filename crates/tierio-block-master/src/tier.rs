//! Global storage tier ordering
//!
//! Every storage level alias in the cluster ("MEM", "SSD", ...) has a
//! global ordinal position. Block locations are reported to clients sorted
//! by this ordinal, fastest tier first. The ordering must be consistent
//! across masters.

use std::collections::HashMap;

/// Total ordering over storage tier aliases.
#[derive(Clone, Debug)]
pub struct StorageTierOrder {
    aliases: Vec<String>,
    ordinals: HashMap<String, usize>,
}

impl StorageTierOrder {
    /// Create an ordering from aliases listed fastest first.
    pub fn new(aliases: impl IntoIterator<Item = String>) -> Self {
        let aliases: Vec<String> = aliases.into_iter().collect();
        let ordinals = aliases
            .iter()
            .enumerate()
            .map(|(ordinal, alias)| (alias.clone(), ordinal))
            .collect();
        Self { aliases, ordinals }
    }

    /// The ordinal of an alias, if the alias is known.
    #[must_use]
    pub fn ordinal(&self, alias: &str) -> Option<usize> {
        self.ordinals.get(alias).copied()
    }

    /// Whether the alias is part of the global ordering.
    #[must_use]
    pub fn contains(&self, alias: &str) -> bool {
        self.ordinals.contains_key(alias)
    }

    /// All aliases in ordinal order.
    #[must_use]
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }
}

impl Default for StorageTierOrder {
    fn default() -> Self {
        Self::new(["MEM", "SSD", "HDD"].map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals() {
        let order = StorageTierOrder::default();
        assert_eq!(order.ordinal("MEM"), Some(0));
        assert_eq!(order.ordinal("SSD"), Some(1));
        assert_eq!(order.ordinal("HDD"), Some(2));
        assert_eq!(order.ordinal("TAPE"), None);
        assert!(order.contains("SSD"));
    }
}

//! Filter terms - the externally managed tracking set
//!
//! Terms decide which events the upstream feed delivers. They are mutated
//! elsewhere (an admin surface, an operator script) and only ever polled
//! here; set equality between two polls is the sole restart trigger for the
//! upstream subscription.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use virta_core::Result;

/// The set of terms currently tracked upstream
///
/// Unique and unordered as far as comparison goes; a `BTreeSet` keeps
/// logging output stable.
pub type TermSet = BTreeSet<String>;

/// Source of the live filter-term set
#[async_trait]
pub trait TermSource: Send + Sync {
    /// The currently enabled terms
    async fn enabled_terms(&self) -> Result<TermSet>;
}

/// In-memory term source for tests and single-process deployments
///
/// Terms carry an enabled flag so they can be switched off without being
/// forgotten, mirroring how an admin surface manages them.
pub struct MemoryTermSource {
    terms: RwLock<BTreeMap<String, bool>>,
}

impl MemoryTermSource {
    /// Create an empty term source
    pub fn new() -> Self {
        Self {
            terms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a term, enabled
    pub fn add(&self, term: impl Into<String>) {
        self.terms.write().insert(term.into(), true);
    }

    /// Enable or disable an existing term; unknown terms are ignored
    pub fn set_enabled(&self, term: &str, enabled: bool) {
        if let Some(flag) = self.terms.write().get_mut(term) {
            *flag = enabled;
        }
    }

    /// Forget a term entirely
    pub fn remove(&self, term: &str) {
        self.terms.write().remove(term);
    }
}

impl Default for MemoryTermSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TermSource for MemoryTermSource {
    async fn enabled_terms(&self) -> Result<TermSet> {
        Ok(self
            .terms
            .read()
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(term, _)| term.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_enabled_terms_are_returned() {
        let source = MemoryTermSource::new();
        source.add("rust");
        source.add("tokio");
        source.set_enabled("tokio", false);

        let terms = source.enabled_terms().await.unwrap();
        assert_eq!(terms, TermSet::from(["rust".to_string()]));
    }

    #[tokio::test]
    async fn reenabled_terms_come_back() {
        let source = MemoryTermSource::new();
        source.add("rust");
        source.set_enabled("rust", false);
        assert!(source.enabled_terms().await.unwrap().is_empty());

        source.set_enabled("rust", true);
        assert_eq!(source.enabled_terms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removed_terms_are_gone() {
        let source = MemoryTermSource::new();
        source.add("rust");
        source.remove("rust");
        assert!(source.enabled_terms().await.unwrap().is_empty());
    }
}

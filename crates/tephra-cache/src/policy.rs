//! Cache Policies
//!
//! Per-request and per-value control over cache behavior. A build policy
//! carries a base policy plus overrides for individual values, so a node
//! can keep non-streaming outputs fully cached while fetching streaming
//! mips existence-only.

use bitflags::bitflags;

use crate::record::ValueId;

bitflags! {
    /// Cache behavior flags for one request or one value
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CachePolicy: u8 {
        /// Query the cache before building
        const QUERY = 1 << 0;
        /// Store the result after a build
        const STORE_ON_BUILD = 1 << 1;
        /// Fetch existence and hash only, not payload bytes
        const SKIP_DATA = 1 << 2;
    }
}

impl CachePolicy {
    /// Query, then store on build
    pub const DEFAULT: Self = Self::QUERY.union(Self::STORE_ON_BUILD);

    /// Strip the query flag: the build always re-executes and overwrites
    pub fn force_rebuild(self) -> Self {
        self & !Self::QUERY
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Base policy plus per-value overrides for one build node
#[derive(Debug, Clone, Default)]
pub struct BuildCachePolicy {
    base: CachePolicy,
    overrides: Vec<(ValueId, CachePolicy)>,
}

impl BuildCachePolicy {
    pub fn new(base: CachePolicy) -> Self {
        Self {
            base,
            overrides: Vec::new(),
        }
    }

    /// Override the policy for one value
    pub fn with_value_policy(mut self, id: ValueId, policy: CachePolicy) -> Self {
        self.overrides.push((id, policy));
        self
    }

    pub fn base(&self) -> CachePolicy {
        self.base
    }

    /// Effective policy for a value: its override, or the base policy
    pub fn policy_for(&self, id: &ValueId) -> CachePolicy {
        self.overrides
            .iter()
            .find(|(value, _)| value == id)
            .map(|(_, policy)| *policy)
            .unwrap_or(self.base)
    }

    /// True when any part of this policy allows querying the cache
    pub fn queries_cache(&self) -> bool {
        self.base.contains(CachePolicy::QUERY)
            || self
                .overrides
                .iter()
                .any(|(_, policy)| policy.contains(CachePolicy::QUERY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = CachePolicy::DEFAULT;
        assert!(policy.contains(CachePolicy::QUERY));
        assert!(policy.contains(CachePolicy::STORE_ON_BUILD));
        assert!(!policy.contains(CachePolicy::SKIP_DATA));
    }

    #[test]
    fn test_force_rebuild_strips_query() {
        let policy = CachePolicy::DEFAULT.force_rebuild();
        assert!(!policy.contains(CachePolicy::QUERY));
        assert!(policy.contains(CachePolicy::STORE_ON_BUILD));
    }

    #[test]
    fn test_per_value_overrides() {
        let policy = BuildCachePolicy::new(CachePolicy::DEFAULT | CachePolicy::SKIP_DATA)
            .with_value_policy(ValueId::Description, CachePolicy::DEFAULT)
            .with_value_policy(ValueId::MipTail, CachePolicy::DEFAULT);

        assert!(!policy
            .policy_for(&ValueId::Description)
            .contains(CachePolicy::SKIP_DATA));
        assert!(policy
            .policy_for(&ValueId::Mip(4))
            .contains(CachePolicy::SKIP_DATA));
    }
}

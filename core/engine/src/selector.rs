//! Provider selection.
//!
//! Candidates are filtered on required capabilities and region, then ranked by
//!
//! ```text
//! score = -priority * 10 + 2 * |capabilities ∩ preferred| + 5 (region affinity)
//! ```
//!
//! with ties broken by ascending provider name, so the ranking is a pure
//! function of the candidates and the operation.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use polyweave_common::{CrudOperation, Error, Result};
use polyweave_storage::ProviderDescriptor;

const PRIORITY_WEIGHT: i64 = 10;
const CAPABILITY_BONUS: i64 = 2;
const REGION_BONUS: i64 = 5;

/// Which ranked provider serves reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPreference {
    /// Best-ranked provider.
    #[default]
    Primary,
    /// Second-ranked provider when there is one.
    Secondary,
    /// Providers serving the operation's (or the local) region first.
    Nearest,
}

/// Providers chosen for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Executes the operation.
    pub primary: ProviderDescriptor,
    /// Remaining eligible providers in rank order; reads fail over to these.
    pub fallbacks: Vec<ProviderDescriptor>,
    /// Replica targets of a write.
    pub replicas: Vec<ProviderDescriptor>,
}

impl Selection {
    /// Primary followed by fallbacks.
    pub fn ranked(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderSelector {
    local_region: Option<String>,
    default_provider: Option<String>,
}

impl ProviderSelector {
    pub fn new(local_region: Option<String>, default_provider: Option<String>) -> Self {
        Self {
            local_region,
            default_provider,
        }
    }

    /// Score of one provider for an operation.
    pub fn score(&self, provider: &ProviderDescriptor, operation: &CrudOperation) -> i64 {
        let overlap = operation
            .options
            .preferred_capabilities
            .iter()
            .filter(|c| provider.capabilities.contains(*c))
            .count() as i64;

        let region_bonus = if self.has_affinity(provider, operation) {
            REGION_BONUS
        } else {
            0
        };

        -(provider.priority as i64) * PRIORITY_WEIGHT + overlap * CAPABILITY_BONUS + region_bonus
    }

    /// Rank the eligible candidates, most preferred first.
    ///
    /// A provider hint (explicit, or the default provider for unconstrained
    /// operations) restricts the result to that provider.
    ///
    /// # Errors
    /// - `Error::NoSuitableProvider` if no candidate qualifies
    pub fn select(
        &self,
        operation: &CrudOperation,
        candidates: &[ProviderDescriptor],
    ) -> Result<Vec<ProviderDescriptor>> {
        let eligible = self.eligible(operation, candidates);

        if let Some(hint) = self.effective_hint(operation, candidates) {
            return eligible
                .into_iter()
                .find(|p| p.name == hint)
                .map(|p| vec![p.clone()])
                .ok_or_else(|| {
                    Error::NoSuitableProvider(format!(
                        "provider '{}' cannot serve operation {}",
                        hint, operation.id
                    ))
                });
        }

        if eligible.is_empty() {
            return Err(Error::NoSuitableProvider(format!(
                "no provider satisfies capabilities {:?} in region {:?} for operation {}",
                operation.required_capabilities(),
                operation.options.region,
                operation.id
            )));
        }

        Ok(self.rank(eligible.into_iter(), operation))
    }

    /// Enabled candidates with the operation's capabilities, in its region.
    fn eligible<'a>(
        &self,
        operation: &CrudOperation,
        candidates: &'a [ProviderDescriptor],
    ) -> Vec<&'a ProviderDescriptor> {
        let required = operation.required_capabilities();
        let region = operation.options.region.as_deref();

        candidates
            .iter()
            .filter(|p| p.enabled)
            .filter(|p| p.has_capabilities(&required))
            .filter(|p| region.map(|r| p.serves_region(r)).unwrap_or(true))
            .collect()
    }

    /// Choose the executing provider, read fallbacks and replica targets.
    ///
    /// Writes get up to `replication_factor - 1` replicas, drawn in rank
    /// order from the candidates eligible for the operation and never equal
    /// to the primary. A provider hint does not narrow the replica set.
    pub fn plan(
        &self,
        operation: &CrudOperation,
        candidates: &[ProviderDescriptor],
        replication_factor: usize,
        read_preference: ReadPreference,
    ) -> Result<Selection> {
        let mut ranked = self.select(operation, candidates)?;

        if !operation.kind.is_write() {
            match read_preference {
                ReadPreference::Primary => {}
                ReadPreference::Secondary if ranked.len() > 1 => ranked.swap(0, 1),
                ReadPreference::Secondary => {}
                ReadPreference::Nearest => {
                    // Stable: keeps score order within each group.
                    ranked.sort_by_key(|p| !self.has_affinity(p, operation));
                }
            }
        }

        let primary = ranked.remove(0);

        let replicas = if operation.kind.is_write() && replication_factor > 1 {
            self.rank(self.eligible(operation, candidates).into_iter(), operation)
                .into_iter()
                .filter(|p| p.name != primary.name)
                .take(replication_factor - 1)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Selection {
            primary,
            fallbacks: ranked,
            replicas,
        })
    }

    fn rank<'a>(
        &self,
        providers: impl Iterator<Item = &'a ProviderDescriptor>,
        operation: &CrudOperation,
    ) -> Vec<ProviderDescriptor> {
        let mut scored: Vec<(i64, &ProviderDescriptor)> = providers
            .map(|p| (self.score(p, operation), p))
            .collect();
        scored.sort_by(|a, b| match b.0.cmp(&a.0) {
            Ordering::Equal => a.1.name.cmp(&b.1.name),
            other => other,
        });
        scored.into_iter().map(|(_, p)| p.clone()).collect()
    }

    fn has_affinity(&self, provider: &ProviderDescriptor, operation: &CrudOperation) -> bool {
        operation
            .options
            .region
            .as_deref()
            .or(self.local_region.as_deref())
            .map(|r| provider.serves_region(r))
            .unwrap_or(false)
    }

    /// The explicit hint, or the default provider when the operation is
    /// unconstrained and the default is among the candidates.
    fn effective_hint<'a>(
        &'a self,
        operation: &'a CrudOperation,
        candidates: &[ProviderDescriptor],
    ) -> Option<&'a str> {
        if let Some(hint) = operation.provider.as_deref() {
            return Some(hint);
        }

        let unconstrained = operation.required_capabilities().is_empty()
            && operation.options.region.is_none();
        if !unconstrained {
            return None;
        }
        self.default_provider
            .as_deref()
            .filter(|d| candidates.iter().any(|p| p.name == *d && p.enabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyweave_common::OperationOptions;
    use polyweave_storage::BackendKind;
    use serde_json::json;

    fn provider(name: &str, priority: u32) -> ProviderDescriptor {
        ProviderDescriptor::new(name, BackendKind::Sql).with_priority(priority)
    }

    fn names(providers: &[ProviderDescriptor]) -> Vec<&str> {
        providers.iter().map(|p| p.name.as_str()).collect()
    }

    fn write() -> CrudOperation {
        CrudOperation::create("users", json!({"id": "u1"}))
    }

    #[test]
    fn test_priority_ordering() {
        let selector = ProviderSelector::default();
        let candidates = vec![provider("b", 2), provider("a", 3), provider("c", 1)];

        let ranked = selector.select(&write(), &candidates).unwrap();
        assert_eq!(names(&ranked), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_ties_break_by_name() {
        let selector = ProviderSelector::default();
        let candidates = vec![provider("zeta", 1), provider("alpha", 1), provider("mid", 1)];

        for _ in 0..10 {
            let ranked = selector.select(&write(), &candidates).unwrap();
            assert_eq!(ranked[0].name, "alpha");
        }
    }

    #[test]
    fn test_capability_filter_and_bonus() {
        let selector = ProviderSelector::default();
        let candidates = vec![
            provider("plain", 0),
            provider("tx", 1).with_capabilities(["transactions", "fulltext"]),
        ];

        let mut op = write();
        op.options.transactional = true;
        assert_eq!(names(&selector.select(&op, &candidates).unwrap()), vec!["tx"]);

        let mut op = write();
        op.options.preferred_capabilities = vec!["fulltext".to_string()];
        let ranked = selector.select(&op, &candidates).unwrap();
        // -10 + 2 < 0
        assert_eq!(ranked[0].name, "plain");
        assert_eq!(selector.score(&ranked[1], &op), -8);
    }

    #[test]
    fn test_region_constraint() {
        let selector = ProviderSelector::default();
        let candidates = vec![
            provider("us", 0).with_regions(["us"]),
            provider("eu", 1).with_regions(["eu"]),
        ];

        let mut op = write();
        op.options.region = Some("eu".to_string());
        assert_eq!(names(&selector.select(&op, &candidates).unwrap()), vec!["eu"]);

        op.options.region = Some("ap".to_string());
        assert!(matches!(
            selector.select(&op, &candidates),
            Err(Error::NoSuitableProvider(_))
        ));
    }

    #[test]
    fn test_hint_restricts() {
        let selector = ProviderSelector::default();
        let candidates = vec![provider("a", 0), provider("b", 5)];

        let op = write().with_provider("b");
        assert_eq!(names(&selector.select(&op, &candidates).unwrap()), vec!["b"]);

        let op = write().with_provider("missing");
        assert!(selector.select(&op, &candidates).is_err());
    }

    #[test]
    fn test_default_provider_only_when_unconstrained() {
        let selector = ProviderSelector::new(None, Some("b".to_string()));
        let candidates = vec![provider("a", 0), provider("b", 5).with_capabilities(["graph"])];

        assert_eq!(selector.select(&write(), &candidates).unwrap()[0].name, "b");

        let mut op = write();
        op.options.required_capabilities = vec!["graph".to_string()];
        assert_eq!(selector.select(&op, &candidates).unwrap()[0].name, "b");

        let mut op = write();
        op.options.preferred_capabilities = vec!["graph".to_string()];
        assert_eq!(selector.select(&op, &candidates).unwrap()[0].name, "b");

        let unavailable = vec![provider("a", 0)];
        assert_eq!(selector.select(&write(), &unavailable).unwrap()[0].name, "a");
    }

    #[test]
    fn test_replicas_exclude_primary() {
        let selector = ProviderSelector::default();
        let candidates = vec![
            provider("primary", 1).with_regions(["us"]),
            provider("replica", 2).with_regions(["us"]),
            provider("spare", 3),
        ];

        let plan = selector
            .plan(&write(), &candidates, 2, ReadPreference::Primary)
            .unwrap();
        assert_eq!(plan.primary.name, "primary");
        assert_eq!(names(&plan.replicas), vec!["replica"]);

        let plan = selector
            .plan(&write(), &candidates, 10, ReadPreference::Primary)
            .unwrap();
        assert_eq!(names(&plan.replicas), vec!["replica", "spare"]);

        let hinted = write().with_provider("replica");
        let plan = selector
            .plan(&hinted, &candidates, 2, ReadPreference::Primary)
            .unwrap();
        assert_eq!(plan.primary.name, "replica");
        assert_eq!(names(&plan.replicas), vec!["primary"]);
    }

    #[test]
    fn test_replicas_respect_capabilities_and_region() {
        let selector = ProviderSelector::default();
        let candidates = vec![
            provider("eu-primary", 1)
                .with_regions(["eu"])
                .with_capabilities(["transactions"]),
            provider("us-cache", 2).with_regions(["us"]),
            provider("eu-plain", 3).with_regions(["eu"]),
            provider("eu-backup", 4)
                .with_regions(["eu"])
                .with_capabilities(["transactions"]),
        ];
        let options = OperationOptions {
            region: Some("eu".to_string()),
            transactional: true,
            ..OperationOptions::default()
        };

        let op = write().with_options(options.clone());
        let plan = selector
            .plan(&op, &candidates, 3, ReadPreference::Primary)
            .unwrap();
        assert_eq!(plan.primary.name, "eu-primary");
        assert_eq!(names(&plan.replicas), vec!["eu-backup"]);

        let op = write().with_options(options).with_provider("eu-primary");
        let plan = selector
            .plan(&op, &candidates[..2], 2, ReadPreference::Primary)
            .unwrap();
        assert!(plan.replicas.is_empty());
    }

    #[test]
    fn test_reads_get_no_replicas() {
        let selector = ProviderSelector::default();
        let candidates = vec![provider("a", 0), provider("b", 1)];
        let read = CrudOperation::read("users", json!({}));

        let plan = selector
            .plan(&read, &candidates, 3, ReadPreference::Primary)
            .unwrap();
        assert!(plan.replicas.is_empty());
        assert_eq!(names(&plan.fallbacks), vec!["b"]);
    }

    #[test]
    fn test_secondary_read_preference() {
        let selector = ProviderSelector::default();
        let candidates = vec![provider("a", 0), provider("b", 1)];
        let read = CrudOperation::read("users", json!({}));

        let plan = selector
            .plan(&read, &candidates, 1, ReadPreference::Secondary)
            .unwrap();
        assert_eq!(plan.primary.name, "b");
        assert_eq!(names(&plan.fallbacks), vec!["a"]);

        let single = vec![provider("a", 0)];
        let plan = selector
            .plan(&read, &single, 1, ReadPreference::Secondary)
            .unwrap();
        assert_eq!(plan.primary.name, "a");
    }

    #[test]
    fn test_nearest_read_preference() {
        let selector = ProviderSelector::new(Some("eu".to_string()), None);
        let candidates = vec![
            provider("far", 0).with_regions(["us"]),
            provider("near", 2).with_regions(["eu"]),
        ];
        let read = CrudOperation::read("users", json!({}));

        let plan = selector
            .plan(&read, &candidates, 1, ReadPreference::Primary)
            .unwrap();
        assert_eq!(plan.primary.name, "far");

        let plan = selector
            .plan(&read, &candidates, 1, ReadPreference::Nearest)
            .unwrap();
        assert_eq!(plan.primary.name, "near");
    }
}

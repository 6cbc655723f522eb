//! Release ledger for one release name.
//!
//! The whole history is one serialized document. Callers load it once, mutate
//! it in memory and write it back wholesale.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{Resource, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl ReleaseStatus {
    pub fn is_terminal(&self) -> bool { !matches!(self, ReleaseStatus::InProgress) }
}

/// A built-in workload and the native revision recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedWorkload {
    pub id: ResourceId,
    /// Opaque revision token; `None` until read back from the cluster.
    #[serde(default)]
    pub revision: Option<String>,
    /// Applied spec, kept for suffix-versioned workloads. Their objects are
    /// retired once a later release succeeds, so rollback re-creates them from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Resource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub number: u32,
    pub status: ReleaseStatus,
    /// Unix seconds.
    pub started_at: i64,
    #[serde(default)]
    pub resources: Vec<ResourceId>,
    /// Subset of `resources` that carry a release-number suffix.
    #[serde(default)]
    pub versioned: Vec<ResourceId>,
    /// Full specs at deploy time. Only present when pruning was enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<Vec<Resource>>,
    #[serde(default)]
    pub managed_workloads: Vec<ManagedWorkload>,
    #[serde(default)]
    pub custom_workloads: Vec<Resource>,
    #[serde(default)]
    pub pruned: Vec<ResourceId>,
}

impl Release {
    fn new(number: u32) -> Self {
        Self {
            number,
            status: ReleaseStatus::InProgress,
            started_at: chrono::Utc::now().timestamp(),
            resources: Vec::new(),
            versioned: Vec::new(),
            specs: None,
            managed_workloads: Vec::new(),
            custom_workloads: Vec::new(),
            pruned: Vec::new(),
        }
    }

    pub fn has_workloads(&self) -> bool {
        !self.managed_workloads.is_empty() || !self.custom_workloads.is_empty()
    }

    pub fn revision_of(&self, id: &ResourceId) -> Option<&str> {
        self.managed_workloads.iter().find(|w| &w.id == id).and_then(|w| w.revision.as_deref())
    }

    pub fn spec_of(&self, id: &ResourceId) -> Option<&Resource> {
        self.specs.as_ref()?.iter().find(|r| &r.id == id)
    }

    /// Suffix-versioned built-in workloads: objects owned by this release alone.
    pub fn versioned_workloads(&self) -> impl Iterator<Item = &ResourceId> {
        self.versioned.iter().filter(|id| crate::kinds::MANAGED_WORKLOAD_KINDS.contains(&id.kind.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseHistory {
    /// Kept sorted by number, ascending.
    #[serde(default)]
    pub releases: Vec<Release>,
    /// Highest number ever allocated; retired entries never free their number.
    #[serde(default)]
    pub last_number: u32,
}

impl ReleaseHistory {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.releases.is_empty() }

    pub fn len(&self) -> usize { self.releases.len() }

    pub fn next_number(&self) -> u32 {
        self.releases.last().map(|r| r.number).unwrap_or(0).max(self.last_number) + 1
    }

    /// Append an InProgress release with the next number.
    pub fn create_release(&mut self, ids: Vec<ResourceId>) -> &mut Release {
        let mut rel = Release::new(self.next_number());
        rel.resources = ids;
        self.push(rel)
    }

    /// Like `create_release`, also keeping the full specs for later prune diffing.
    pub fn create_release_with_specs(&mut self, resources: &[Resource]) -> &mut Release {
        let mut rel = Release::new(self.next_number());
        rel.resources = resources.iter().map(|r| r.id.clone()).collect();
        rel.specs = Some(resources.to_vec());
        self.push(rel)
    }

    fn push(&mut self, mut rel: Release) -> &mut Release {
        if let Some(specs) = &rel.specs {
            rel.versioned = specs.iter().filter(|r| r.versioned).map(|r| r.id.clone()).collect();
        }
        self.last_number = self.last_number.max(rel.number);
        let idx = self.releases.len();
        self.releases.push(rel);
        &mut self.releases[idx]
    }

    pub fn latest(&self) -> Option<&Release> { self.releases.last() }

    pub fn latest_mut(&mut self) -> Option<&mut Release> { self.releases.last_mut() }

    pub fn get(&self, number: u32) -> Option<&Release> {
        self.releases.iter().find(|r| r.number == number)
    }

    pub fn get_mut(&mut self, number: u32) -> Option<&mut Release> {
        self.releases.iter_mut().find(|r| r.number == number)
    }

    /// Latest Succeeded release strictly before `excluding`. Failed entries are
    /// skipped even when numerically closest.
    pub fn previous_rollback_eligible(&self, excluding: u32) -> Option<&Release> {
        self.releases
            .iter()
            .rev()
            .filter(|r| r.number < excluding)
            .find(|r| r.status == ReleaseStatus::Succeeded)
    }

    pub fn last_successful(&self) -> Option<&Release> {
        self.releases.iter().rev().find(|r| r.status == ReleaseStatus::Succeeded)
    }

    /// Drop releases older than the last successful one and every Failed one,
    /// then cap the ledger at `max_releases` entries. Returns what was removed
    /// so callers can retire its versioned objects.
    pub fn cleanup(&mut self, max_releases: usize) -> Vec<Release> {
        let floor = self.last_successful().map(|r| r.number).unwrap_or(0);
        let (keep, mut retired): (Vec<Release>, Vec<Release>) = std::mem::take(&mut self.releases)
            .into_iter()
            .partition(|r| r.number >= floor && r.status != ReleaseStatus::Failed);
        self.releases = keep;
        let cap = max_releases.max(1);
        if self.releases.len() > cap {
            let excess = self.releases.len() - cap;
            retired.extend(self.releases.drain(..excess));
        }
        retired.sort_by_key(|r| r.number);
        retired
    }

    /// Every resource id recorded by any release, first-seen order, deduplicated.
    pub fn all_resource_ids(&self) -> Vec<ResourceId> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for rel in &self.releases {
            for id in &rel.resources {
                if seen.insert(id.clone()) {
                    out.push(id.clone());
                }
            }
        }
        out
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).context("serializing release history")
    }

    /// Blank input yields an empty history.
    pub fn deserialize(blob: &str) -> Result<Self> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut h: Self = serde_json::from_str(blob).context("parsing release history")?;
        h.releases.sort_by_key(|r| r.number);
        Ok(h)
    }
}

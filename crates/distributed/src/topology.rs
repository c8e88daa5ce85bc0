//! Participant resolution for a two-step query.
//!
//! Mode is chosen per call:
//! - stable: no jointly queried cache is rebalancing, primaries are used as-is
//!   after the join-consistency checks;
//! - unstable replicated: main cache is replicated and rebalancing, nodes owning
//!   every partition of every cache are used;
//! - unstable partitioned: each partition is pinned to one node owning it in
//!   every jointly queried cache, producing an explicit node -> partitions map.
//!
//! A consistency violation while rebalancing is in flight is a retry; the same
//! violation on a settled topology is a [`TsqError::ConfigurationMismatch`].

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use rand::seq::IteratorRandom;
use tracing::debug;
use tsq_common::{NodeId, PartitionId, Result, TsqError};

use crate::cluster::{CacheMode, CacheTopology, ClusterView};

/// Nodes taking part in one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    pub nodes: BTreeSet<NodeId>,
    /// Explicit partition assignment; only under unstable partitioned resolution.
    pub partitions: Option<BTreeMap<NodeId, Vec<PartitionId>>>,
}

impl Participants {
    fn from_nodes(nodes: BTreeSet<NodeId>) -> Self {
        Self {
            nodes,
            partitions: None,
        }
    }

    fn from_assignment(assignment: BTreeMap<NodeId, Vec<PartitionId>>) -> Self {
        Self {
            nodes: assignment.keys().cloned().collect(),
            partitions: Some(assignment),
        }
    }

    /// Keep one random node.
    pub fn narrow_to_single<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.nodes.len() <= 1 {
            return;
        }
        let Some(chosen) = self.nodes.iter().choose(rng).cloned() else {
            return;
        };
        self.nodes = BTreeSet::from([chosen.clone()]);
        if let Some(parts) = &mut self.partitions {
            parts.retain(|node, _| *node == chosen);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(Participants),
    /// Ownership is in flux; resolve again on a later attempt.
    Retry { reason: String },
}

impl Resolution {
    fn retry(reason: impl Into<String>) -> Self {
        Resolution::Retry {
            reason: reason.into(),
        }
    }
}

/// Resolve participants for a query on `space` joined with `extra_spaces`.
///
/// `single_node` forces a single random participant (explain mode). A
/// replicated main cache always runs on a single node.
pub fn resolve<R: Rng + ?Sized>(
    cluster: &dyn ClusterView,
    space: &str,
    extra_spaces: &[String],
    single_node: bool,
    rng: &mut R,
) -> Result<Resolution> {
    let main = load_cache(cluster, space)?;
    let mut extras = Vec::with_capacity(extra_spaces.len());
    for name in extra_spaces {
        let cache = load_cache(cluster, name)?;
        if cache.mode != CacheMode::Local {
            extras.push(cache);
        }
    }

    let rebalancing = main.rebalancing || extras.iter().any(|c| c.rebalancing);
    let resolution = if !rebalancing {
        stable_data_nodes(cluster, &main, &extras)?
    } else if main.is_replicated() {
        replicated_unstable_data_nodes(&main, &extras)?
    } else {
        partitioned_unstable_data_nodes(&main, &extras, rng)?
    };

    Ok(match resolution {
        Resolution::Ready(mut participants) => {
            if single_node || main.is_replicated() {
                participants.narrow_to_single(rng);
            }
            debug!(
                space,
                nodes = participants.nodes.len(),
                explicit_partitions = participants.partitions.is_some(),
                operator = "TopologyResolver",
                "resolved query participants"
            );
            Resolution::Ready(participants)
        }
        retry => retry,
    })
}

fn load_cache(cluster: &dyn ClusterView, name: &str) -> Result<CacheTopology> {
    cluster
        .cache(name)
        .ok_or_else(|| TsqError::InvalidConfig(format!("cache {name} is not started")))
}

fn no_data_nodes(cache: &str) -> TsqError {
    TsqError::ConfigurationMismatch(format!("failed to find data nodes for cache: {cache}"))
}

fn replicated_with_partitioned(main: &str, extra: &str) -> TsqError {
    TsqError::ConfigurationMismatch(format!(
        "queries running on replicated cache {main} must not join partitioned cache {extra}"
    ))
}

/// Whether any of the caches started rebalancing since they were loaded.
fn rebalancing_now(cluster: &dyn ClusterView, caches: &[&str]) -> bool {
    caches
        .iter()
        .any(|name| cluster.cache(name).map(|c| c.rebalancing).unwrap_or(false))
}

fn stable_data_nodes(
    cluster: &dyn ClusterView,
    main: &CacheTopology,
    extras: &[CacheTopology],
) -> Result<Resolution> {
    let nodes = main.data_nodes.clone();
    if nodes.is_empty() {
        return Err(no_data_nodes(&main.name));
    }

    for extra in extras {
        if main.is_replicated() && extra.is_partitioned() {
            return Err(replicated_with_partitioned(&main.name, &extra.name));
        }
        if extra.data_nodes.is_empty() {
            return Err(no_data_nodes(&extra.name));
        }

        let violation = match (main.mode, extra.mode) {
            (CacheMode::Partitioned, CacheMode::Partitioned) => {
                if extra.partitions != main.partitions {
                    // Partition counts never change with rebalancing.
                    return Err(TsqError::ConfigurationMismatch(format!(
                        "partitioned caches {} and {} have different partition counts ({} vs {})",
                        main.name, extra.name, main.partitions, extra.partitions
                    )));
                }
                (extra.data_nodes != nodes).then(|| {
                    format!(
                        "partitioned caches {} and {} have different data nodes",
                        main.name, extra.name
                    )
                })
            }
            (CacheMode::Replicated, CacheMode::Replicated) => {
                (extra.data_nodes != nodes).then(|| {
                    format!(
                        "replicated caches {} and {} have different data nodes",
                        main.name, extra.name
                    )
                })
            }
            (CacheMode::Partitioned, CacheMode::Replicated) => {
                (!extra.data_nodes.is_superset(&nodes)).then(|| {
                    format!(
                        "replicated cache {} is not present on every data node of {}",
                        extra.name, main.name
                    )
                })
            }
            _ => None,
        };

        if let Some(violation) = violation {
            if rebalancing_now(cluster, &[main.name.as_str(), extra.name.as_str()]) {
                return Ok(Resolution::retry(violation));
            }
            return Err(TsqError::ConfigurationMismatch(violation));
        }
    }

    Ok(Resolution::Ready(Participants::from_nodes(nodes)))
}

fn replicated_unstable_data_nodes(
    main: &CacheTopology,
    extras: &[CacheTopology],
) -> Result<Resolution> {
    if main.data_nodes.is_empty() {
        return Err(no_data_nodes(&main.name));
    }
    let mut nodes = main.full_owners();
    if nodes.is_empty() {
        return Ok(Resolution::retry(format!(
            "no node owns every partition of replicated cache {}",
            main.name
        )));
    }
    for extra in extras {
        if extra.is_partitioned() {
            return Err(replicated_with_partitioned(&main.name, &extra.name));
        }
        if extra.data_nodes.is_empty() {
            return Err(no_data_nodes(&extra.name));
        }
        let owners = extra.full_owners();
        nodes.retain(|n| owners.contains(n));
        if nodes.is_empty() {
            return Ok(Resolution::retry(format!(
                "replicated caches {} and {} share no complete owner",
                main.name, extra.name
            )));
        }
    }
    Ok(Resolution::Ready(Participants::from_nodes(nodes)))
}

fn partitioned_unstable_data_nodes<R: Rng + ?Sized>(
    main: &CacheTopology,
    extras: &[CacheTopology],
    rng: &mut R,
) -> Result<Resolution> {
    let mut partitioned = Vec::new();
    let mut replicated: Option<BTreeSet<NodeId>> = None;
    for extra in extras {
        match extra.mode {
            CacheMode::Partitioned => {
                if extra.partitions != main.partitions {
                    return Err(TsqError::ConfigurationMismatch(format!(
                        "partitioned caches {} and {} have different partition counts ({} vs {})",
                        main.name, extra.name, main.partitions, extra.partitions
                    )));
                }
                partitioned.push(extra);
            }
            CacheMode::Replicated => {
                if extra.data_nodes.is_empty() {
                    return Err(no_data_nodes(&extra.name));
                }
                let owners = extra.full_owners();
                let nodes = match replicated.take() {
                    Some(mut acc) => {
                        acc.retain(|n| owners.contains(n));
                        acc
                    }
                    None => owners,
                };
                if nodes.is_empty() {
                    return Ok(Resolution::retry(format!(
                        "no node owns every partition of replicated cache {}",
                        extra.name
                    )));
                }
                replicated = Some(nodes);
            }
            CacheMode::Local => {}
        }
    }

    let mut assignment: BTreeMap<NodeId, Vec<PartitionId>> = BTreeMap::new();
    for part in 0..main.partitions {
        let owners = main.owners_of(part);
        if owners.is_empty() {
            if main.data_nodes.is_empty() {
                return Err(TsqError::ConfigurationMismatch(format!(
                    "failed to find data nodes for cache {} partition {part}",
                    main.name
                )));
            }
            return Ok(Resolution::retry(format!(
                "partition {part} of {} has no owner",
                main.name
            )));
        }
        let mut candidates: BTreeSet<NodeId> = owners.iter().cloned().collect();

        for extra in &partitioned {
            let extra_owners = extra.owners_of(part);
            if extra_owners.is_empty() && extra.data_nodes.is_empty() {
                return Err(TsqError::ConfigurationMismatch(format!(
                    "failed to find data nodes for cache {} partition {part}",
                    extra.name
                )));
            }
            candidates.retain(|n| extra_owners.contains(n));
            if candidates.is_empty() {
                return Ok(Resolution::retry(format!(
                    "partition {part} has no common owner in {} and {}",
                    main.name, extra.name
                )));
            }
        }

        if let Some(repl) = &replicated {
            candidates.retain(|n| repl.contains(n));
            if candidates.is_empty() {
                return Ok(Resolution::retry(format!(
                    "owners of partition {part} of {} hold no complete replicated copy",
                    main.name
                )));
            }
        }

        let node = if candidates.len() == 1 {
            candidates.pop_first()
        } else {
            candidates.into_iter().choose(rng)
        };
        let Some(node) = node else {
            return Ok(Resolution::retry(format!("partition {part} has no candidate")));
        };
        assignment.entry(node).or_default().push(part);
    }

    if assignment.is_empty() {
        return Err(no_data_nodes(&main.name));
    }
    Ok(Resolution::Ready(Participants::from_assignment(assignment)))
}

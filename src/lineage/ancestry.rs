//! Stream ancestry: which streams a stream was (transitively) forked from.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::errors::LineageError;
use crate::models::{Checkpoint, Stream};

/// Upper bound on the length of any parent chain. Deeper chains are treated
/// as corruption.
pub const MAX_LINEAGE_DEPTH: usize = 1024;

#[derive(Debug, Default)]
pub struct AncestryMap {
    ancestors: HashMap<String, HashSet<String>>,
}

impl AncestryMap {
    /// Compute ancestors for every stream.
    ///
    /// Walks upward iteratively. Results are memoized, so a chain is walked
    /// only until it reaches a stream whose ancestry is already known.
    pub fn build(streams: &[Stream]) -> Result<Self, LineageError> {
        Self::build_with_limit(streams, MAX_LINEAGE_DEPTH)
    }

    pub fn build_with_limit(streams: &[Stream], max_depth: usize) -> Result<Self, LineageError> {
        let parents: HashMap<&str, Option<&str>> = streams
            .iter()
            .map(|s| (s.id.as_str(), s.parent_stream.as_deref()))
            .collect();
        let mut ancestors: HashMap<String, HashSet<String>> = HashMap::new();

        for stream in streams {
            if ancestors.contains_key(&stream.id) {
                continue;
            }

            // Walk up until a root, an unknown parent, or a memoized stream.
            let mut chain: Vec<&str> = vec![stream.id.as_str()];
            let mut visited: HashSet<&str> = HashSet::from([stream.id.as_str()]);
            let mut cursor = stream.id.as_str();
            let mut base: HashSet<String> = HashSet::new();
            loop {
                let Some(parent) = parents.get(cursor).copied().flatten() else {
                    break;
                };
                if let Some(known) = ancestors.get(parent) {
                    base = known.clone();
                    base.insert(parent.to_string());
                    break;
                }
                if !visited.insert(parent) {
                    return Err(LineageError::Cycle {
                        stream_id: parent.to_string(),
                    });
                }
                if chain.len() >= max_depth {
                    return Err(LineageError::DepthExceeded {
                        stream_id: stream.id.clone(),
                        max_depth,
                    });
                }
                if !parents.contains_key(parent) {
                    // Parent not in the set: it is an ancestor with no further lineage.
                    base.insert(parent.to_string());
                    break;
                }
                chain.push(parent);
                cursor = parent;
            }

            // Fill in from the top of the chain down.
            let mut acc = base;
            for &id in chain.iter().rev() {
                ancestors.insert(id.to_string(), acc.clone());
                acc.insert(id.to_string());
            }
        }

        Ok(Self { ancestors })
    }

    pub fn ancestors(&self, stream_id: &str) -> Option<&HashSet<String>> {
        self.ancestors.get(stream_id)
    }

    /// Two streams are related if one descends from the other.
    pub fn are_related(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let descends = |child: &str, ancestor: &str| {
            self.ancestors
                .get(child)
                .is_some_and(|set| set.contains(ancestor))
        };
        descends(a, b) || descends(b, a)
    }
}

/// A file touched by checkpoints on streams that do not descend from
/// one another, so their overlays may disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrentEdit {
    pub path: String,
    pub streams: Vec<String>,
}

pub fn concurrent_edits(checkpoints: &[Checkpoint], ancestry: &AncestryMap) -> Vec<ConcurrentEdit> {
    let mut touched: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for cp in checkpoints {
        for path in &cp.stats.files {
            touched
                .entry(path.as_str())
                .or_default()
                .insert(cp.stream_id.as_str());
        }
    }

    touched
        .into_iter()
        .filter_map(|(path, streams)| {
            let streams: Vec<&str> = streams.into_iter().collect();
            let mut conflicting: BTreeSet<&str> = BTreeSet::new();
            for (i, a) in streams.iter().enumerate() {
                for b in &streams[i + 1..] {
                    if !ancestry.are_related(a, b) {
                        conflicting.insert(*a);
                        conflicting.insert(*b);
                    }
                }
            }
            (!conflicting.is_empty()).then(|| ConcurrentEdit {
                path: path.to_string(),
                streams: conflicting.into_iter().map(String::from).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiffStats, ReviewStatus};
    use chrono::Utc;

    fn stream(id: &str, parent: Option<&str>) -> Stream {
        Stream {
            id: id.into(),
            parent_stream: parent.map(String::from),
            name: id.into(),
            created_at: Utc::now(),
        }
    }

    fn cp(stream_id: &str, files: &[&str]) -> Checkpoint {
        Checkpoint {
            id: format!("cp-{}", stream_id),
            stream_id: stream_id.into(),
            execution_id: None,
            task_id: None,
            commit_sha: "0".repeat(40),
            parent_commit: None,
            stats: DiffStats {
                files_changed: files.len() as i64,
                insertions: 1,
                deletions: 0,
                files: files.iter().map(|f| f.to_string()).collect(),
            },
            checkpointed_at: Utc::now(),
            review_status: ReviewStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
        }
    }

    #[test]
    fn test_ancestors_of_chain() {
        let map = AncestryMap::build(&[
            stream("c", Some("b")),
            stream("a", None),
            stream("b", Some("a")),
        ])
        .unwrap();
        let c = map.ancestors("c").unwrap();
        assert!(c.contains("a") && c.contains("b"));
        assert_eq!(c.len(), 2);
        assert!(map.ancestors("a").unwrap().is_empty());
        assert!(map.are_related("a", "c"));
        assert!(map.are_related("c", "a"));
    }

    #[test]
    fn test_siblings_are_unrelated() {
        let map = AncestryMap::build(&[
            stream("root", None),
            stream("left", Some("root")),
            stream("right", Some("root")),
        ])
        .unwrap();
        assert!(!map.are_related("left", "right"));
        assert!(map.are_related("left", "root"));
    }

    #[test]
    fn test_cycle_is_reported() {
        let err = AncestryMap::build(&[stream("a", Some("b")), stream("b", Some("a"))]).unwrap_err();
        assert!(matches!(err, LineageError::Cycle { .. }));
    }

    #[test]
    fn test_depth_cap() {
        let mut streams = vec![stream("s0", None)];
        for i in 1..20 {
            streams.push(Stream {
                parent_stream: Some(format!("s{}", i - 1)),
                ..stream(&format!("s{}", i), None)
            });
        }
        // Build from the deepest stream first so nothing is memoized yet.
        streams.reverse();
        let err = AncestryMap::build_with_limit(&streams, 5).unwrap_err();
        assert!(matches!(err, LineageError::DepthExceeded { max_depth: 5, .. }));
        assert!(AncestryMap::build_with_limit(&streams, 50).is_ok());
    }

    #[test]
    fn test_long_chain_is_iterative() {
        let mut streams = vec![stream("s0", None)];
        for i in 1..1000 {
            streams.push(Stream {
                parent_stream: Some(format!("s{}", i - 1)),
                ..stream(&format!("s{}", i), None)
            });
        }
        streams.reverse();
        let map = AncestryMap::build(&streams).unwrap();
        assert_eq!(map.ancestors("s999").unwrap().len(), 999);
    }

    #[test]
    fn test_parent_outside_set_counts_as_ancestor() {
        let map = AncestryMap::build(&[stream("child", Some("gone"))]).unwrap();
        assert!(map.ancestors("child").unwrap().contains("gone"));
    }

    #[test]
    fn test_concurrent_edits_only_between_unrelated_streams() {
        let map = AncestryMap::build(&[
            stream("root", None),
            stream("left", Some("root")),
            stream("right", Some("root")),
        ])
        .unwrap();
        let edits = concurrent_edits(
            &[
                cp("root", &["shared.rs", "base.rs"]),
                cp("left", &["shared.rs", "base.rs"]),
                cp("right", &["shared.rs"]),
            ],
            &map,
        );
        assert_eq!(
            edits,
            vec![ConcurrentEdit {
                path: "shared.rs".into(),
                streams: vec!["left".into(), "right".into()],
            }]
        );
    }
}

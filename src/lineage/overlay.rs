//! Ordering checkpoints so that parent-stream work applies before the
//! work of streams forked from it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Checkpoint, Stream};

#[derive(Debug, Clone, Serialize)]
pub struct OverlayOrder {
    pub checkpoints: Vec<Checkpoint>,
    /// Set when stream edges were cyclic and creation-time order was used.
    pub fell_back: bool,
}

impl OverlayOrder {
    pub fn ids(&self) -> Vec<&str> {
        self.checkpoints.iter().map(|c| c.id.as_str()).collect()
    }
}

fn by_time(a: &Checkpoint, b: &Checkpoint) -> Ordering {
    a.checkpointed_at
        .cmp(&b.checkpointed_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Order `checkpoints` for overlay.
///
/// Checkpoints are grouped by stream and sorted by time within each group.
/// Streams are ordered topologically, ancestor before descendant. A stream
/// hangs under its nearest ancestor that has checkpoints here, so streams
/// without checkpoints in between still order their descendants. Ties go to
/// the older stream, then the smaller id. Streams missing from `streams`
/// count as roots created at their first checkpoint.
pub fn overlay_order(checkpoints: &[Checkpoint], streams: &[Stream]) -> OverlayOrder {
    let mut groups: BTreeMap<&str, Vec<&Checkpoint>> = BTreeMap::new();
    for cp in checkpoints {
        groups.entry(cp.stream_id.as_str()).or_default().push(cp);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| by_time(a, b));
    }

    let known: HashMap<&str, &Stream> = streams.iter().map(|s| (s.id.as_str(), s)).collect();
    let created: HashMap<&str, DateTime<Utc>> = groups
        .iter()
        .map(|(&id, group)| {
            let at = known
                .get(id)
                .map(|s| s.created_at)
                .unwrap_or(group[0].checkpointed_at);
            (id, at)
        })
        .collect();
    let sort_key = |id: &str| (created[id], id.to_string());

    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = groups.keys().map(|&id| (id, 0)).collect();
    let mut cyclic = false;
    for &id in groups.keys() {
        let mut seen: HashSet<&str> = HashSet::from([id]);
        let mut cursor = id;
        while let Some(parent) = known.get(cursor).and_then(|s| s.parent_stream.as_deref()) {
            if !seen.insert(parent) {
                cyclic = true;
                break;
            }
            if groups.contains_key(parent) {
                children.entry(parent).or_default().push(id);
                if let Some(deg) = in_degree.get_mut(id) {
                    *deg += 1;
                }
                break;
            }
            cursor = parent;
        }
    }

    // Ready set keyed by (created_at, id) so the pop order is deterministic.
    let mut ready: BTreeMap<(DateTime<Utc>, String), &str> = in_degree
        .iter()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(&id, _)| (sort_key(id), id))
        .collect();
    let mut stream_order: Vec<&str> = Vec::with_capacity(groups.len());
    while let Some((_, id)) = ready.pop_first() {
        stream_order.push(id);
        for &child in children.get(id).map(|c| c.as_slice()).unwrap_or(&[]) {
            if let Some(deg) = in_degree.get_mut(child) {
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(sort_key(child), child);
                }
            }
        }
    }

    if cyclic || stream_order.len() != groups.len() {
        tracing::warn!(
            streams = groups.len(),
            ordered = stream_order.len(),
            "Stream lineage contains a cycle; falling back to creation-time checkpoint order"
        );
        let mut flat: Vec<Checkpoint> = checkpoints.to_vec();
        flat.sort_by(by_time);
        return OverlayOrder {
            checkpoints: flat,
            fell_back: true,
        };
    }

    OverlayOrder {
        checkpoints: stream_order
            .into_iter()
            .flat_map(|id| groups[id].iter().map(|&cp| cp.clone()))
            .collect(),
        fell_back: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiffStats, ReviewStatus};
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn stream(id: &str, parent: Option<&str>, created: i64) -> Stream {
        Stream {
            id: id.into(),
            parent_stream: parent.map(String::from),
            name: id.into(),
            created_at: at(created),
        }
    }

    fn cp(id: &str, stream_id: &str, secs: i64) -> Checkpoint {
        Checkpoint {
            id: id.into(),
            stream_id: stream_id.into(),
            execution_id: None,
            task_id: None,
            commit_sha: id.repeat(8),
            parent_commit: None,
            stats: DiffStats::default(),
            checkpointed_at: at(secs),
            review_status: ReviewStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
        }
    }

    #[test]
    fn test_chain_orders_parent_first_regardless_of_input() {
        let streams = vec![
            stream("C", Some("B"), 2),
            stream("A", None, 0),
            stream("B", Some("A"), 1),
        ];
        // Child checkpoints are older than parent ones on purpose.
        let checkpoints = vec![
            cp("c1", "C", 10),
            cp("a2", "A", 40),
            cp("b1", "B", 20),
            cp("a1", "A", 30),
        ];
        let order = overlay_order(&checkpoints, &streams);
        assert!(!order.fell_back);
        assert_eq!(order.ids(), vec!["a1", "a2", "b1", "c1"]);
    }

    #[test]
    fn test_siblings_ordered_by_stream_creation_then_id() {
        let streams = vec![
            stream("root", None, 0),
            stream("late", Some("root"), 5),
            stream("early", Some("root"), 1),
            stream("same-b", Some("root"), 3),
            stream("same-a", Some("root"), 3),
        ];
        let checkpoints = vec![
            cp("late1", "late", 1),
            cp("early1", "early", 2),
            cp("b1", "same-b", 3),
            cp("a1", "same-a", 4),
            cp("r1", "root", 9),
        ];
        let order = overlay_order(&checkpoints, &streams);
        assert_eq!(order.ids(), vec!["r1", "early1", "a1", "b1", "late1"]);
    }

    #[test]
    fn test_streams_without_checkpoints_still_order_descendants() {
        // C was created before A, but descends from it through B, which has
        // no checkpoints of its own.
        let streams = vec![
            stream("C", Some("B"), 0),
            stream("A", None, 5),
            stream("B", Some("A"), 6),
        ];
        let checkpoints = vec![cp("c1", "C", 1), cp("a1", "A", 9)];
        let order = overlay_order(&checkpoints, &streams);
        assert!(!order.fell_back);
        assert_eq!(order.ids(), vec!["a1", "c1"]);
    }

    #[test]
    fn test_cycle_above_checkpointed_streams_falls_back() {
        let streams = vec![
            stream("leaf", Some("X"), 0),
            stream("X", Some("Y"), 1),
            stream("Y", Some("X"), 2),
        ];
        let order = overlay_order(&[cp("l2", "leaf", 5), cp("l1", "leaf", 3)], &streams);
        assert!(order.fell_back);
        assert_eq!(order.ids(), vec!["l1", "l2"]);
    }

    #[test]
    fn test_edges_to_absent_streams_are_ignored() {
        // B's parent has no checkpoints here, so B is a root.
        let streams = vec![stream("A", None, 0), stream("B", Some("A"), 1)];
        let order = overlay_order(&[cp("b1", "B", 5)], &streams);
        assert_eq!(order.ids(), vec!["b1"]);
    }

    #[test]
    fn test_cycle_falls_back_to_creation_time() {
        let streams = vec![stream("X", Some("Y"), 0), stream("Y", Some("X"), 1)];
        let checkpoints = vec![cp("y1", "Y", 2), cp("x1", "X", 1), cp("x2", "X", 3)];
        let order = overlay_order(&checkpoints, &streams);
        assert!(order.fell_back);
        assert_eq!(order.ids(), vec!["x1", "y1", "x2"]);
    }

    #[test]
    fn test_same_time_checkpoints_tiebreak_on_id() {
        let streams = vec![stream("A", None, 0)];
        let order = overlay_order(&[cp("b", "A", 1), cp("a", "A", 1)], &streams);
        assert_eq!(order.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_stream_is_a_root() {
        let order = overlay_order(&[cp("z1", "ghost", 1)], &[]);
        assert_eq!(order.ids(), vec!["z1"]);
        assert!(!order.fell_back);
    }
}

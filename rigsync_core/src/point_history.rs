//! Append-only store of per-point 3D trajectories.

use crate::array_triangulator::{PointEstimate, PointResult};
use crate::error::{HistoryError, LogError};
use crate::packets::{PointId, SyncIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

/// Header of the triangulated point table.
pub const XYZ_HEADER: &str = "sync_index,point_id,x,y,z,reprojection_error,status";

/// One entry of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub sync_index: SyncIndex,
    pub result: PointResult,
}

/// point_id → samples in strictly increasing sync order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointHistory {
    trajectories: BTreeMap<PointId, Vec<TrajectorySample>>,
}

impl PointHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one result. Rejected, with no change, unless `sync_index` is
    /// after the last index recorded for the point.
    pub fn append(&mut self, sync_index: SyncIndex, point_id: PointId, result: PointResult) -> Result<(), HistoryError> {
        self.check(sync_index, point_id)?;
        self.trajectories
            .entry(point_id)
            .or_default()
            .push(TrajectorySample { sync_index, result });
        Ok(())
    }

    /// Append every estimate of one sync index, or none of them.
    pub fn append_all(&mut self, estimates: &[PointEstimate]) -> Result<usize, HistoryError> {
        let mut staged: BTreeMap<PointId, SyncIndex> = BTreeMap::new();
        for e in estimates {
            match staged.get(&e.point_id) {
                Some(last) if e.sync_index <= *last => {
                    return Err(HistoryError::OutOfOrder {
                        point_id: e.point_id,
                        sync_index: e.sync_index,
                        last: *last,
                    })
                }
                _ => self.check(e.sync_index, e.point_id)?,
            }
            staged.insert(e.point_id, e.sync_index);
        }
        for e in estimates {
            self.trajectories
                .entry(e.point_id)
                .or_default()
                .push(TrajectorySample {
                    sync_index: e.sync_index,
                    result: e.result,
                });
        }
        Ok(estimates.len())
    }

    fn check(&self, sync_index: SyncIndex, point_id: PointId) -> Result<(), HistoryError> {
        match self.last_index(point_id) {
            Some(last) if sync_index <= last => Err(HistoryError::OutOfOrder {
                point_id,
                sync_index,
                last,
            }),
            _ => Ok(()),
        }
    }

    /// Last sync index recorded for a point.
    pub fn last_index(&self, point_id: PointId) -> Option<SyncIndex> {
        self.trajectories
            .get(&point_id)
            .and_then(|t| t.last())
            .map(|s| s.sync_index)
    }

    pub fn trajectory(&self, point_id: PointId) -> Option<&[TrajectorySample]> {
        self.trajectories.get(&point_id).map(Vec::as_slice)
    }

    /// Every point's result at one sync index, ascending by point id.
    pub fn snapshot(&self, sync_index: SyncIndex) -> Vec<PointEstimate> {
        self.trajectories
            .iter()
            .filter_map(|(point_id, samples)| {
                let i = samples.binary_search_by_key(&sync_index, |s| s.sync_index).ok()?;
                Some(PointEstimate {
                    sync_index,
                    point_id: *point_id,
                    result: samples[i].result,
                })
            })
            .collect()
    }

    /// The full table ordered by `(sync_index, point_id)`.
    pub fn rows(&self) -> Vec<PointEstimate> {
        let mut rows: Vec<PointEstimate> = self
            .trajectories
            .iter()
            .flat_map(|(point_id, samples)| {
                samples.iter().map(move |s| PointEstimate {
                    sync_index: s.sync_index,
                    point_id: *point_id,
                    result: s.result,
                })
            })
            .collect();
        rows.sort_by_key(|r| (r.sync_index, r.point_id));
        rows
    }

    pub fn point_ids(&self) -> Vec<PointId> {
        self.trajectories.keys().copied().collect()
    }

    pub fn sync_indices(&self) -> Vec<SyncIndex> {
        self.trajectories
            .values()
            .flatten()
            .map(|s| s.sync_index)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.trajectories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.trajectories
            .values()
            .flatten()
            .filter(|s| s.result.is_resolved())
            .count()
    }

    /// Write the table as CSV. Unresolved rows leave the coordinates blank.
    pub fn write_csv<W: Write>(&self, mut out: W) -> Result<(), LogError> {
        writeln!(out, "{XYZ_HEADER}")?;
        for row in self.rows() {
            match row.result {
                PointResult::Resolved(p) => writeln!(
                    out,
                    "{},{},{},{},{},{},resolved",
                    row.sync_index,
                    row.point_id,
                    p.position.x,
                    p.position.y,
                    p.position.z,
                    p.reprojection_error
                )?,
                PointResult::Unresolved(reason) => {
                    writeln!(out, "{},{},,,,,{}", row.sync_index, row.point_id, reason)?
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<(), LogError> {
        let file = std::fs::File::create(path)?;
        self.write_csv(std::io::BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array_triangulator::{Point3D, UnresolvedReason};
    use nalgebra::Vector3;

    fn resolved(x: f64) -> PointResult {
        PointResult::Resolved(Point3D {
            position: Vector3::new(x, 0.5, -1.25),
            reprojection_error: 0.125,
        })
    }

    #[test]
    fn test_append_and_query() {
        let mut history = PointHistory::new();
        history.append(0, 1, resolved(1.0)).unwrap();
        history.append(0, 2, PointResult::Unresolved(UnresolvedReason::SingleView)).unwrap();
        history.append(2, 1, resolved(2.0)).unwrap();

        assert_eq!(history.len(), 3);
        assert_eq!(history.resolved_count(), 2);
        assert_eq!(history.point_ids(), vec![1, 2]);
        assert_eq!(history.sync_indices(), vec![0, 2]);
        assert_eq!(history.trajectory(1).unwrap().len(), 2);
        assert_eq!(history.last_index(1), Some(2));

        let snap = history.snapshot(0);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[1].point_id, 2);
        assert!(history.snapshot(1).is_empty());
    }

    #[test]
    fn test_out_of_order_rejected_without_change() {
        let mut history = PointHistory::new();
        history.append(5, 1, resolved(1.0)).unwrap();
        let before = history.clone();

        let err = history.append(5, 1, resolved(9.0)).unwrap_err();
        assert_eq!(err, HistoryError::OutOfOrder { point_id: 1, sync_index: 5, last: 5 });
        assert!(history.append(3, 1, resolved(9.0)).is_err());
        assert_eq!(history, before);
    }

    #[test]
    fn test_append_all_is_all_or_nothing() {
        let mut history = PointHistory::new();
        history.append(4, 2, resolved(0.0)).unwrap();
        let before = history.clone();

        let batch = [
            PointEstimate { sync_index: 4, point_id: 1, result: resolved(1.0) },
            PointEstimate { sync_index: 4, point_id: 2, result: resolved(2.0) },
        ];
        assert!(history.append_all(&batch).is_err());
        assert_eq!(history, before);

        let batch = [
            PointEstimate { sync_index: 5, point_id: 1, result: resolved(1.0) },
            PointEstimate { sync_index: 5, point_id: 2, result: resolved(2.0) },
        ];
        assert_eq!(history.append_all(&batch).unwrap(), 2);
        assert_eq!(history.snapshot(5).len(), 2);
    }

    #[test]
    fn test_csv_export() {
        let mut history = PointHistory::new();
        history.append(1, 3, resolved(0.1)).unwrap();
        history.append(0, 4, PointResult::Unresolved(UnresolvedReason::AllCandidatesRejected)).unwrap();

        let mut buf = Vec::new();
        history.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], XYZ_HEADER);
        assert_eq!(lines[1], "0,4,,,,,all_candidates_rejected");
        assert_eq!(lines[2], "1,3,0.1,0.5,-1.25,0.125,resolved");
    }

    #[test]
    fn test_serde_round_trip() {
        let mut history = PointHistory::new();
        history.append(0, 1, resolved(0.3)).unwrap();
        history.append(1, 1, PointResult::Unresolved(UnresolvedReason::Degenerate)).unwrap();

        let json = serde_json::to_string(&history).unwrap();
        let back: PointHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, history);
    }
}

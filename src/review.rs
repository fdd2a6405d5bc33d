//! Persisting the suspicious-detection set and reconciling reviewer feedback.
//!
//! A compute pass writes a [`ReviewIndex`] next to the (externally rendered)
//! review artifacts. A reviewer then walks the artifact folder and deletes
//! the images that show real animals. The reconciliation pass reads the index
//! back and keeps only the locations whose artifact survived — or, when an
//! explicit accepted-name list is supplied, the locations named by it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Options;
use crate::matcher::DetectionLocation;
use crate::num::TotalF32;
use crate::Error;

/// Name of the index file written into the review folder.
pub const REVIEW_INDEX_FILE_NAME: &str = "detection_index.json";

/// The persisted result of a compute pass: everything a later reconciliation
/// run needs to reproduce context without re-running the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewIndex {
    /// Per-directory suspicious locations; indices align with
    /// `dir_index_to_name`.
    pub suspicious_detections: Vec<Vec<DetectionLocation>>,
    pub dir_index_to_name: BTreeMap<usize, String>,
    /// The configuration that produced this set.
    pub options: Options,
}

impl ReviewIndex {
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::info!("wrote review index to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let index: ReviewIndex = serde_json::from_str(&fs::read_to_string(path)?)?;
        if index.suspicious_detections.len() != index.dir_index_to_name.len() {
            return Err(Error::CorruptInput(format!(
                "review index {} has {} directories but {} suspicious-detection lists",
                path.display(),
                index.dir_index_to_name.len(),
                index.suspicious_detections.len()
            )));
        }
        Ok(index)
    }
}

/// The designated review-artifact filename for one location.
///
/// All components are zero-padded to a fixed width so filesystem ordering
/// matches logical ordering.
pub fn sample_file_name(
    dir_index: usize,
    detection_index: usize,
    cluster_label: Option<usize>,
    instance_count: usize,
) -> String {
    let cluster = match cluster_label {
        Some(label) => format!("_c{label:0>4}"),
        None => String::new(),
    };
    format!("dir{dir_index:0>4}_det{detection_index:0>4}{cluster}_n{instance_count:0>4}.jpg")
}

/// Sorts every location's instances descending by confidence and assigns its
/// review-artifact filename.
///
/// Must run after review ordering: the detection ordinal in the name is the
/// position within the (sorted) directory list.
pub fn assign_sample_file_names(suspicious: &mut [Vec<DetectionLocation>]) {
    for (dir_index, directory_locations) in suspicious.iter_mut().enumerate() {
        for (detection_index, location) in directory_locations.iter_mut().enumerate() {
            location
                .instances
                .sort_by_key(|instance| std::cmp::Reverse(TotalF32(instance.confidence)));
            location.sample_file_name = sample_file_name(
                dir_index,
                detection_index,
                location.cluster_label,
                location.instances.len(),
            );
        }
    }
}

/// How reviewer decisions are communicated back.
pub enum ReviewFeedback<'a> {
    /// A location is accepted (still a false positive) iff its artifact name
    /// appears in this set.
    AcceptedNames(&'a HashSet<String>),
    /// A location is accepted iff its artifact file still exists under the
    /// review folder. A deleted artifact is the reviewer saying "this was a
    /// real detection" — a missing file here is a signal, never an error.
    SurvivingFiles { review_dir: &'a Path },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub loaded: usize,
    pub removed: usize,
}

/// Drops every location the reviewer rejected, preserving the order of the
/// survivors and the 1:1 alignment between directories and lists.
pub fn reconcile(
    suspicious: &mut [Vec<DetectionLocation>],
    feedback: &ReviewFeedback<'_>,
) -> ReconcileStats {
    let mut stats = ReconcileStats::default();

    for (dir_index, locations) in suspicious.iter_mut().enumerate() {
        let before = locations.len();
        stats.loaded += before;

        locations.retain(|location| match feedback {
            ReviewFeedback::AcceptedNames(names) => names.contains(&location.sample_file_name),
            ReviewFeedback::SurvivingFiles { review_dir } => {
                review_dir.join(&location.sample_file_name).is_file()
            }
        });

        let removed = before - locations.len();
        if removed > 0 {
            log::info!("removed {removed} of {before} locations from directory {dir_index}");
        }
        stats.removed += removed;
    }

    log::info!(
        "removed {} of {} total locations via review feedback",
        stats.removed,
        stats.loaded
    );
    stats
}

/// Loads an accepted-name list: one artifact filename per line.
pub fn load_accepted_names(path: &Path) -> Result<HashSet<String>, Error> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{location, options};

    fn named_locations(count: usize) -> Vec<DetectionLocation> {
        let locations = (0..count)
            .map(|i| location("dir", i, [0.1 * i as f32, 0.1, 0.05, 0.05], 3))
            .collect::<Vec<_>>();
        let mut wrapped = vec![locations];
        assign_sample_file_names(&mut wrapped);
        wrapped.pop().unwrap()
    }

    #[test]
    fn artifact_names_are_fixed_width() {
        assert_eq!(sample_file_name(0, 7, None, 23), "dir0000_det0007_n0023.jpg");
        assert_eq!(
            sample_file_name(12, 3, Some(2), 104),
            "dir0012_det0003_c0002_n0104.jpg"
        );
    }

    #[test]
    fn assign_names_sorts_instances_by_confidence() {
        let mut loc = location("dir", 0, [0.1, 0.1, 0.05, 0.05], 3);
        loc.instances[0].confidence = 0.2;
        loc.instances[1].confidence = 0.9;
        loc.instances[2].confidence = 0.5;

        let mut suspicious = vec![vec![loc]];
        assign_sample_file_names(&mut suspicious);

        let confidences = suspicious[0][0]
            .instances
            .iter()
            .map(|i| i.confidence)
            .collect::<Vec<_>>();
        assert_eq!(confidences, vec![0.9, 0.5, 0.2]);
        assert_eq!(suspicious[0][0].sample_file_name, "dir0000_det0000_n0003.jpg");
    }

    #[test]
    fn round_trip_preserves_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let index = ReviewIndex {
            suspicious_detections: vec![named_locations(3), Vec::new()],
            dir_index_to_name: BTreeMap::from([(0, "dir".to_string()), (1, "other".to_string())]),
            options: options(),
        };

        let path = dir.path().join(REVIEW_INDEX_FILE_NAME);
        index.save(&path).unwrap();
        let loaded = ReviewIndex::load(&path).unwrap();

        assert_eq!(loaded.dir_index_to_name, index.dir_index_to_name);
        assert_eq!(loaded.suspicious_detections.len(), 2);
        let (a, b) = (
            &index.suspicious_detections[0],
            &loaded.suspicious_detections[0],
        );
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.bbox, y.bbox);
            assert_eq!(x.sample_file_name, y.sample_file_name);
            assert_eq!(x.instances.len(), y.instances.len());
            for (ix, iy) in x.instances.iter().zip(&y.instances) {
                assert_eq!(ix.file, iy.file);
                assert_eq!(ix.bbox, iy.bbox);
                assert_eq!(ix.confidence, iy.confidence);
                assert_eq!(ix.detection_index, iy.detection_index);
            }
        }
    }

    #[test]
    fn index_field_names_are_stable() {
        let index = ReviewIndex {
            suspicious_detections: vec![named_locations(1)],
            dir_index_to_name: BTreeMap::from([(0, "dir".to_string())]),
            options: options(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&index).unwrap()).unwrap();
        assert!(value.get("suspiciousDetections").is_some());
        assert!(value.get("dirIndexToName").is_some());
        assert!(value.get("options").is_some());
        let location = &value["suspiciousDetections"][0][0];
        assert!(location.get("relativeDir").is_some());
        assert!(location.get("sampleFileName").is_some());
        assert!(location["instances"][0].get("detectionIndex").is_some());
    }

    #[test]
    fn accepted_list_reconciliation_drops_the_rest() {
        let mut suspicious = vec![named_locations(3)];
        let accepted = HashSet::from([suspicious[0][1].sample_file_name.clone()]);

        let stats = reconcile(&mut suspicious, &ReviewFeedback::AcceptedNames(&accepted));
        assert_eq!(stats, ReconcileStats { loaded: 3, removed: 2 });
        assert_eq!(suspicious[0].len(), 1);
        assert_eq!(suspicious[0][0].id, 1);
    }

    #[test]
    fn surviving_file_reconciliation_checks_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut suspicious = vec![named_locations(3)];

        // The reviewer "kept" artifacts 0 and 2 and deleted artifact 1.
        for location in [&suspicious[0][0], &suspicious[0][2]] {
            fs::write(dir.path().join(&location.sample_file_name), b"jpg").unwrap();
        }

        let stats = reconcile(
            &mut suspicious,
            &ReviewFeedback::SurvivingFiles {
                review_dir: dir.path(),
            },
        );
        assert_eq!(stats, ReconcileStats { loaded: 3, removed: 1 });
        let ids = suspicious[0].iter().map(|l| l.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn accepted_name_list_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accepted.txt");
        fs::write(&path, "dir0000_det0000_n0003.jpg\n\n  dir0000_det0002_n0003.jpg \n").unwrap();
        let names = load_accepted_names(&path).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("dir0000_det0002_n0003.jpg"));
    }
}

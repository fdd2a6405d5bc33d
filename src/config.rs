//! Run configuration.

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Maps a relative image path to the directory key its detections are grouped
/// under. Used when multiple physical folders belong to the same camera in a
/// manufacturer-specific way.
pub type DirNameFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// How image rows are grouped into directories for matching.
///
/// The two modes are mutually exclusive by construction; there is no way to
/// combine a custom function with leaf-level grouping.
#[derive(Clone)]
pub enum DirGrouping {
    /// Group by the parent directory, `n` additional levels up from the leaf.
    LeafLevels(usize),
    /// Group by a caller-supplied classification function.
    Custom(DirNameFn),
}

impl DirGrouping {
    /// Returns the directory key for a (forward-slash) relative image path.
    pub fn dir_name(&self, relative_path: &str) -> String {
        match self {
            DirGrouping::LeafLevels(levels) => {
                let mut dir = parent_dir(relative_path);
                for _ in 0..*levels {
                    dir = parent_dir(dir);
                }
                dir.to_string()
            }
            DirGrouping::Custom(f) => f(relative_path),
        }
    }
}

/// Returns the parent of a forward-slash relative path, or `""` at the root.
pub(crate) fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

impl Default for DirGrouping {
    fn default() -> Self {
        DirGrouping::LeafLevels(0)
    }
}

impl fmt::Debug for DirGrouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirGrouping::LeafLevels(levels) => write!(f, "LeafLevels({levels})"),
            DirGrouping::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// A classification function cannot round-trip through the review index, so it
// serializes as a bare tag. Deserializing that tag falls back to leaf
// grouping: the reconciliation pass never re-derives grouping, it reads the
// already-partitioned set from the index.
impl Serialize for DirGrouping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DirGrouping::LeafLevels(levels) => {
                serializer.serialize_newtype_variant("DirGrouping", 0, "leafLevels", levels)
            }
            DirGrouping::Custom(_) => serializer.serialize_str("custom"),
        }
    }
}

impl<'de> Deserialize<'de> for DirGrouping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Tagged {
                #[serde(rename = "leafLevels")]
                leaf_levels: usize,
            },
            Tag(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Tagged { leaf_levels } => Ok(DirGrouping::LeafLevels(leaf_levels)),
            Repr::Tag(tag) if tag == "custom" => {
                log::warn!("custom directory grouping cannot be restored from disk; using leaf grouping");
                Ok(DirGrouping::LeafLevels(0))
            }
            Repr::Tag(tag) => Err(de::Error::custom(format!(
                "unknown directory grouping `{tag}`"
            ))),
        }
    }
}

/// Which backend executes the per-directory matching tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerBackend {
    /// A fixed-size pool of worker threads.
    Threads,
    /// Everything on the calling thread, in submission order.
    Inline,
}

/// What to do when a referenced source image is missing on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingImagePolicy {
    /// Log a single warning for the whole run.
    Once,
    /// Log a warning per missing image.
    Always,
    /// Abort the run.
    Fatal,
}

/// How each directory's suspicious locations are ordered for review.
///
/// Purely cosmetic: the *set* of selected locations is identical under every
/// ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// First-occurrence order.
    None,
    /// Left to right by box center.
    XSort,
    /// Cluster nearby boxes, then left to right by cluster.
    ClusterSort,
}

/// Options that control repeat detection elimination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Root of the image tree the table's relative paths resolve against.
    /// May be empty, in which case source-image checks are skipped.
    pub image_base: String,

    /// Where the review folder is created.
    pub output_base: String,

    /// Don't consider detections with confidence lower than this as suspicious.
    pub confidence_min: f32,

    /// Don't consider detections with confidence higher than this as suspicious.
    pub confidence_max: f32,

    /// The IoU threshold for considering two boxes the same location.
    pub iou_threshold: f32,

    /// How many occurrences of a single location are required before we
    /// declare it suspicious?
    pub occurrence_threshold: usize,

    /// Ignore suspicious detections larger than this fraction of the image;
    /// these are often animals taking up the whole frame.
    pub max_suspicious_detection_size: f32,

    /// Ignore suspicious detections smaller than this fraction of the image.
    pub min_suspicious_detection_size: f32,

    /// Skip directories with more than this many images in them.
    pub max_images_per_folder: Option<usize>,

    /// Category ids that are never treated as suspicious.
    pub exclude_categories: Vec<String>,

    pub n_workers: usize,

    pub worker_backend: WorkerBackend,

    /// A previously written review index. Setting this switches the run into
    /// reconciliation mode: no matching, no review folder.
    pub review_file_to_load: Option<PathBuf>,

    /// Flat text file of accepted artifact names, one per line. Only
    /// meaningful in reconciliation mode; when absent, acceptance is judged
    /// by whether each artifact file still exists.
    pub accepted_file_list: Option<PathBuf>,

    /// Whether to create the review folder and the detection index in it.
    pub write_review_folder: bool,

    pub missing_image_policy: MissingImagePolicy,

    /// Filename tokens to replace after loading, for when the directory
    /// structure has changed relative to what the detector saw.
    pub filename_replacements: BTreeMap<String, String>,

    pub dir_grouping: DirGrouping,

    /// Only match within these directories. Exclusive with `exclude_folders`.
    pub include_folders: Option<Vec<String>>,

    /// Never match within these directories. Exclusive with `include_folders`.
    pub exclude_folders: Option<Vec<String>>,

    pub sort_order: SortOrder,

    /// Only relevant for [`SortOrder::ClusterSort`].
    pub cluster_distance_threshold: f32,

    /// Truncate the directory list after this many entries. Debugging aid.
    pub debug_max_dirs: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            image_base: String::new(),
            output_base: String::new(),
            confidence_min: 0.1,
            confidence_max: 1.0,
            iou_threshold: 0.9,
            occurrence_threshold: 20,
            max_suspicious_detection_size: 0.2,
            min_suspicious_detection_size: 0.0,
            max_images_per_folder: None,
            exclude_categories: Vec::new(),
            n_workers: 10,
            worker_backend: WorkerBackend::Threads,
            review_file_to_load: None,
            accepted_file_list: None,
            write_review_folder: true,
            missing_image_policy: MissingImagePolicy::Once,
            filename_replacements: BTreeMap::new(),
            dir_grouping: DirGrouping::default(),
            include_folders: None,
            exclude_folders: None,
            sort_order: SortOrder::XSort,
            cluster_distance_threshold: 0.1,
            debug_max_dirs: None,
        }
    }
}

impl Options {
    /// Rejects conflicting or out-of-range settings, before any matching work
    /// starts.
    pub fn validate(&self) -> Result<(), Error> {
        let conflict = |message: &str| Err(Error::ConfigConflict(message.into()));

        if self.include_folders.is_some() && self.exclude_folders.is_some() {
            return conflict("cannot specify include and exclude folder lists");
        }
        if self.confidence_min > self.confidence_max {
            return conflict("confidence_min exceeds confidence_max");
        }
        if !(0.0..=1.0).contains(&self.min_suspicious_detection_size)
            || !(0.0..=1.0).contains(&self.max_suspicious_detection_size)
            || self.min_suspicious_detection_size > self.max_suspicious_detection_size
        {
            return conflict("suspicious detection size bounds must be an ordered pair in [0, 1]");
        }
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return conflict("iou_threshold must lie in (0, 1]");
        }
        if self.occurrence_threshold == 0 {
            return conflict("occurrence_threshold must be at least 1");
        }
        if self.n_workers == 0 && self.worker_backend == WorkerBackend::Threads {
            return conflict("thread backend requires at least one worker");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn include_and_exclude_lists_conflict() {
        let options = Options {
            include_folders: Some(vec!["a".into()]),
            exclude_folders: Some(vec!["b".into()]),
            ..Options::default()
        };
        assert!(matches!(
            options.validate(),
            Err(Error::ConfigConflict(_))
        ));
    }

    #[test]
    fn inverted_bounds_conflict() {
        let options = Options {
            confidence_min: 0.9,
            confidence_max: 0.2,
            ..Options::default()
        };
        options.validate().unwrap_err();

        let options = Options {
            min_suspicious_detection_size: 0.5,
            max_suspicious_detection_size: 0.1,
            ..Options::default()
        };
        options.validate().unwrap_err();
    }

    #[test]
    fn leaf_level_grouping() {
        let grouping = DirGrouping::LeafLevels(0);
        assert_eq!(grouping.dir_name("site/cam01/img.jpg"), "site/cam01");
        assert_eq!(grouping.dir_name("img.jpg"), "");

        let grouping = DirGrouping::LeafLevels(1);
        assert_eq!(grouping.dir_name("site/cam01/img.jpg"), "site");
    }

    #[test]
    fn custom_grouping_applies_function() {
        let grouping = DirGrouping::Custom(Arc::new(|path: &str| {
            parent_dir(path).trim_end_matches(char::is_numeric).to_string()
        }));
        assert_eq!(grouping.dir_name("site/RECONYX101/img.jpg"), "site/RECONYX");
    }

    #[test]
    fn grouping_serde_round_trip() {
        let json = serde_json::to_string(&DirGrouping::LeafLevels(2)).unwrap();
        assert_eq!(json, r#"{"leafLevels":2}"#);
        let back: DirGrouping = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, DirGrouping::LeafLevels(2)));

        let json = serde_json::to_string(&DirGrouping::Custom(Arc::new(|p: &str| p.into()))).unwrap();
        assert_eq!(json, r#""custom""#);
        let back: DirGrouping = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, DirGrouping::LeafLevels(0)));
    }

    #[test]
    fn options_serde_round_trip() {
        let options = Options {
            exclude_categories: vec!["2".into()],
            max_images_per_folder: Some(5000),
            ..Options::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(back.exclude_categories, options.exclude_categories);
        assert_eq!(back.max_images_per_folder, options.max_images_per_folder);
        assert_eq!(back.iou_threshold, options.iou_threshold);
        assert_eq!(back.sort_order, options.sort_order);
    }
}

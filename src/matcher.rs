//! Per-directory spatial matching of recurring detections.
//!
//! Within one directory, detections that keep landing on (nearly) the same
//! box are grouped into [`DetectionLocation`]s: the first qualifying
//! detection founds a location, and every later detection with IoU at or
//! above the threshold against the location's representative box joins it.
//!
//! Two properties of this grouping are deliberate and load-bearing:
//!
//! * The representative box is frozen at creation. Later instances may have
//!   slightly different geometry; the box is never recentered or expanded.
//! * A detection joins *every* location it overlaps sufficiently, not just
//!   the first one found. This is not transitive clustering, and there is no
//!   first-match-wins short-circuit.

use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::config::Options;
use crate::rect::Rect;
use crate::table::{is_image_file, ImageRecord};
use crate::Error;

/// A single detection event on a single image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionInstance {
    /// Order within the image's detection list.
    pub detection_index: usize,
    /// Relative path of the image this detection appeared on.
    pub file: String,
    pub bbox: Rect,
    pub confidence: f32,
    pub category: String,
}

/// A unique-ish detection location, meaningful in the context of one
/// directory. All instances within the IoU threshold of `bbox` at insertion
/// time are stored in `instances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionLocation {
    /// Representative box, taken from the founding instance and frozen.
    pub bbox: Rect,
    pub category: String,
    pub relative_dir: String,
    /// Discovery order during matching; sorted descending by confidence
    /// before review-artifact names are assigned.
    pub instances: Vec<DetectionInstance>,
    /// Row-iteration index of the founding instance. Only unique-ish within
    /// a directory: two locations founded from the same row share an id.
    pub id: usize,
    /// Assigned by the cluster sort, if that ordering is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_label: Option<usize>,
    /// The designated review-artifact filename for this location.
    #[serde(default)]
    pub sample_file_name: String,
}

/// R-tree payload: the envelope of a location's representative box plus its
/// position in the location list.
struct IndexEntry {
    envelope: AABB<[f32; 2]>,
    location: usize,
}

impl RTreeObject for IndexEntry {
    type Envelope = AABB<[f32; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn envelope(bbox: &Rect) -> AABB<[f32; 2]> {
    AABB::from_corners(
        [bbox.x(), bbox.y()],
        [bbox.x() + bbox.width(), bbox.y() + bbox.height()],
    )
}

/// Finds all unique detection locations in one directory.
///
/// `rows` is the directory's slice of the detection table, in table order.
/// The scan is strictly sequential over rows and detections, so the result
/// only depends on this directory's input, never on scheduling.
pub fn find_matches_in_directory(
    dir_name: &str,
    rows: &[ImageRecord],
    options: &Options,
) -> Result<Vec<DetectionLocation>, Error> {
    if let Some(max_images) = options.max_images_per_folder {
        if rows.len() > max_images {
            log::info!(
                "ignoring directory {dir_name}: {} images (limit set to {max_images})",
                rows.len()
            );
            return Ok(Vec::new());
        }
    }
    if let Some(include) = &options.include_folders {
        if !include.iter().any(|dir| dir == dir_name) {
            log::info!("ignoring directory {dir_name}, not on inclusion list");
            return Ok(Vec::new());
        }
    }
    if let Some(exclude) = &options.exclude_folders {
        if exclude.iter().any(|dir| dir == dir_name) {
            log::info!("ignoring directory {dir_name}, on exclusion list");
            return Ok(Vec::new());
        }
    }

    let mut locations: Vec<DetectionLocation> = Vec::new();
    let mut index: RTree<IndexEntry> = RTree::new();

    for (iteration, row) in rows.iter().enumerate() {
        if !is_image_file(&row.file) {
            continue;
        }

        let Some(detections) = &row.detections else {
            match &row.failure {
                Some(failure) => log::debug!("skipping failed image {} ({failure})", row.file),
                None => log::debug!("skipping row without detections: {}", row.file),
            }
            continue;
        };

        // Don't bother checking images with no detections above threshold.
        let max_conf = row
            .max_detection_conf
            .unwrap_or_else(|| row.max_conf_of_detections());
        if max_conf < options.confidence_min {
            continue;
        }

        for (detection_index, detection) in detections.iter().enumerate() {
            let confidence = detection.conf;
            if !(-1.0..=1.0).contains(&confidence) {
                return Err(Error::CorruptInput(format!(
                    "confidence {confidence} out of range on {}",
                    row.file
                )));
            }
            if confidence < options.confidence_min || confidence > options.confidence_max {
                continue;
            }
            if options
                .exclude_categories
                .iter()
                .any(|category| category == &detection.category)
            {
                continue;
            }

            let bbox = detection.bbox;
            if bbox.width() == 0.0 || bbox.height() == 0.0 {
                continue;
            }

            // These are relative coordinates, so a legal area lies in [0, 1].
            let area = bbox.area();
            if !(0.0..=1.0).contains(&area) {
                return Err(Error::CorruptInput(format!(
                    "illegal bounding box area {area} on {}",
                    row.file
                )));
            }
            if area < options.min_suspicious_detection_size
                || area > options.max_suspicious_detection_size
            {
                continue;
            }

            let instance = DetectionInstance {
                detection_index,
                file: row.file.clone(),
                bbox,
                confidence,
                category: detection.category.clone(),
            };

            // The index returns candidates of all categories; entries are
            // creation-ordered by position, which matches ascending id order.
            let mut candidates = index
                .locate_in_envelope_intersecting(&envelope(&bbox))
                .map(|entry| entry.location)
                .collect::<Vec<_>>();
            candidates.sort_unstable();

            let mut matched = false;
            for &i_location in &candidates {
                let location = &mut locations[i_location];

                // Don't match across categories.
                if location.category != instance.category {
                    continue;
                }

                let iou = match bbox.iou(&location.bbox) {
                    Ok(iou) => iou,
                    Err(err) => {
                        log::warn!("IoU computation error in {dir_name}: {err}");
                        continue;
                    }
                };

                if iou >= options.iou_threshold {
                    matched = true;
                    location.instances.push(instance.clone());
                    // No break: this instance may match multiple locations.
                }
            }

            if !matched {
                index.insert(IndexEntry {
                    envelope: envelope(&bbox),
                    location: locations.len(),
                });
                locations.push(DetectionLocation {
                    bbox,
                    category: instance.category.clone(),
                    relative_dir: dir_name.to_string(),
                    instances: vec![instance],
                    id: iteration,
                    cluster_label: None,
                    sample_file_name: String::new(),
                });
            }
        }
    }

    // Sort by founding iteration, as if the locations had never gone through
    // a tree structure.
    locations.sort_by_key(|location| location.id);

    Ok(locations)
}

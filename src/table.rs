//! The detection-results table.
//!
//! Detector batch output is a JSON file with an `images` array; every row
//! carries a relative path, the maximum detection confidence, and either a
//! detection list or a `failure` string for images the detector could not
//! read. Fields this crate does not interpret (top-level metadata, category
//! maps, per-detection extras) are carried through untouched so a rewritten
//! file stays usable by other tooling.

use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::num::TotalF32;
use crate::rect::Rect;
use crate::Error;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff"];

/// Returns whether `path` has a recognized image extension.
pub fn is_image_file(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// One detector output on one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Category id, e.g. `"1"`.
    pub category: String,
    /// Confidence in `[-1, 1]`; negative means suppressed.
    pub conf: f32,
    /// `[x_min, y_min, width, height]` in relative coordinates.
    pub bbox: Rect,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One row of the table: a single image and its detections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Relative path of the image.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_detection_conf: Option<f32>,
    /// `None` for images the detector failed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
    /// The failure reason for unreadable images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageRecord {
    /// The maximum confidence over this row's detections, or `0.0` if there
    /// are none.
    pub fn max_conf_of_detections(&self) -> f32 {
        self.detections
            .iter()
            .flatten()
            .map(|detection| detection.conf)
            .max_by_key(|&conf| TotalF32(conf))
            .unwrap_or(0.0)
    }
}

/// The full detection-results file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionTable {
    pub images: Vec<ImageRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DetectionTable {
    /// Loads a results file, normalizing backslash paths, applying filename
    /// replacements, and back-filling `max_detection_conf` where the file
    /// omits it.
    pub fn load_json(
        path: &Path,
        replacements: &std::collections::BTreeMap<String, String>,
    ) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let mut table: DetectionTable = serde_json::from_str(&text)?;
        for record in &mut table.images {
            record.file = record.file.replace('\\', "/");
            for (from, to) in replacements {
                record.file = record.file.replace(from.as_str(), to);
            }
            if record.max_detection_conf.is_none() {
                record.max_detection_conf = Some(record.max_conf_of_detections());
            }
        }
        log::debug!(
            "loaded {} rows from {}",
            table.images.len(),
            path.display()
        );
        Ok(table)
    }

    /// Writes the table back out in the same format it was loaded from.
    pub fn write_json(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Maps every filename to its row index. Duplicate filenames make
    /// suppression ambiguous and are rejected.
    pub fn filename_to_row(&self) -> Result<HashMap<String, usize>, Error> {
        let mut map = HashMap::with_capacity(self.images.len());
        for (i_row, record) in self.images.iter().enumerate() {
            if map.insert(record.file.clone(), i_row).is_some() {
                return Err(Error::CorruptInput(format!(
                    "duplicate filename in results: {}",
                    record.file
                )));
            }
        }
        Ok(map)
    }
}

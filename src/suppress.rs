//! Confidence suppression for confirmed repeat detections.
//!
//! Suppressing a detection negates its confidence in place; nothing is
//! deleted, and a later pass (or a human) can always recover the original
//! value by taking the absolute value. Applying suppression twice is a
//! no-op for already-negative entries.

use std::collections::HashMap;
use std::fmt;

use crate::config::Options;
use crate::matcher::DetectionLocation;
use crate::table::DetectionTable;
use crate::Error;

/// Changes below this are treated as float noise, not as a meaningful shift
/// of a row's maximum confidence.
const MEANINGFUL_CHANGE: f32 = 1e-3;

/// What a suppression pass did to the table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SuppressionStats {
    /// Detections whose confidence was flipped negative.
    pub boxes_changed: usize,
    /// Rows whose maximum confidence moved by more than the epsilon.
    pub rows_changed: usize,
    /// Of those, rows whose maximum went from non-negative to negative.
    pub rows_crossed_zero: usize,
    /// Of those, rows whose maximum fell below the configured minimum
    /// confidence, dropping them out of consideration for future passes.
    pub rows_crossed_confidence_min: usize,
}

impl fmt::Display for SuppressionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "changed {} detections, impacting {} row maxima ({} to negative, {} across the confidence threshold)",
            self.boxes_changed, self.rows_changed, self.rows_crossed_zero,
            self.rows_crossed_confidence_min
        )
    }
}

/// Negates the confidence of every instance of every suspicious location,
/// then recomputes each row's maximum confidence.
///
/// Every instance is cross-checked against the table before anything is
/// flipped: its box must still be bit-identical to the table entry and
/// within the IoU threshold of its location's representative box. A failed
/// check means the suspicious set and the table have drifted apart, and the
/// run aborts rather than suppress the wrong detections.
pub fn update_detection_table(
    table: &mut DetectionTable,
    suspicious: &[Vec<DetectionLocation>],
    filename_to_row: &HashMap<String, usize>,
    options: &Options,
) -> Result<SuppressionStats, Error> {
    let mut stats = SuppressionStats::default();

    log::info!("updating the detection table");

    for location in suspicious.iter().flatten() {
        for instance in &location.instances {
            // The instance box should be almost the same as the location's
            // representative box, where "almost" is defined by the IoU
            // threshold.
            let iou = instance.bbox.iou(&location.bbox).map_err(|err| {
                Error::SuppressionInvariant(format!("on {}: {err}", instance.file))
            })?;
            if iou < options.iou_threshold {
                return Err(Error::SuppressionInvariant(format!(
                    "instance on {} has IoU {iou} against its location, below threshold {}",
                    instance.file, options.iou_threshold
                )));
            }

            let &row_index = filename_to_row.get(&instance.file).ok_or_else(|| {
                Error::SuppressionInvariant(format!("no table row for {}", instance.file))
            })?;
            let record = &mut table.images[row_index];
            let detection = record
                .detections
                .as_mut()
                .and_then(|detections| detections.get_mut(instance.detection_index))
                .ok_or_else(|| {
                    Error::SuppressionInvariant(format!(
                        "row {} has no detection at index {}",
                        instance.file, instance.detection_index
                    ))
                })?;

            if !instance.bbox.bits_eq_xyw(&detection.bbox) {
                return Err(Error::SuppressionInvariant(format!(
                    "bounding box mismatch on {} at detection {}",
                    instance.file, instance.detection_index
                )));
            }

            // Flip the confidence negative, unless another instance of an
            // overlapping location already did.
            if detection.conf >= 0.0 {
                detection.conf = -detection.conf;
                stats.boxes_changed += 1;
            }
        }
    }

    // Recompute per-row maxima.
    for record in &mut table.images {
        let Some(detections) = &record.detections else {
            if record.failure.is_none() {
                return Err(Error::CorruptInput(format!(
                    "row {} has neither detections nor a failure reason",
                    record.file
                )));
            }
            continue;
        };
        if detections.is_empty() {
            continue;
        }

        let original = record.max_detection_conf.ok_or_else(|| {
            Error::CorruptInput(format!("row {} is missing max_detection_conf", record.file))
        })?;
        if original < -1.0 {
            return Err(Error::CorruptInput(format!(
                "row {} has max confidence {original}",
                record.file
            )));
        }

        let negatives = detections.iter().filter(|d| d.conf < 0.0).count();
        let new_max = detections
            .iter()
            .map(|d| d.conf)
            .fold(f32::NEG_INFINITY, f32::max);

        // Suppression can only make detections *less* visible.
        if new_max > original {
            return Err(Error::SuppressionInvariant(format!(
                "max confidence on {} rose from {original} to {new_max}",
                record.file
            )));
        }
        record.max_detection_conf = Some(new_max);

        if (new_max - original).abs() > MEANINGFUL_CHANGE {
            stats.rows_changed += 1;
            if new_max < 0.0 && original >= 0.0 {
                stats.rows_crossed_zero += 1;
            }
            if original >= options.confidence_min && new_max < options.confidence_min {
                stats.rows_crossed_confidence_min += 1;
            }
            // Negated confidences are the only thing that can move a row's
            // maximum here.
            if negatives == 0 {
                return Err(Error::SuppressionInvariant(format!(
                    "max confidence on {} changed with no suppressed detection",
                    record.file
                )));
            }
        }
    }

    Ok(stats)
}

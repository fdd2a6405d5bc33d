//! Repeat detection elimination.
//!
//! Camera traps love to hand a detector the same branch, rock, or lens flare
//! a few hundred times in a row, and the detector obliges with a few hundred
//! identical bounding boxes. This crate finds bounding-box locations that
//! recur suspiciously often within a single image directory, suppresses their
//! confidence in the detection table (by negating it, so no data is lost),
//! and supports the two-pass review workflow built around that:
//!
//! 1. A *find* pass groups recurring detections into [`matcher::DetectionLocation`]s
//!    per directory, suppresses the ones above the occurrence threshold, and
//!    persists a [`review::ReviewIndex`] for a human reviewer.
//! 2. A *remove* pass re-loads the index after review, drops the locations
//!    the reviewer rejected, and suppresses only the survivors.
//!
//! [`driver::find_repeat_detections`] is the entry point for both passes.
//!
//! Rendering of the per-location review images is intentionally not part of
//! this crate; it produces the artifact names and paths an external renderer
//! needs, and nothing more.

use log::LevelFilter;

pub mod aggregate;
pub mod config;
pub mod driver;
pub mod matcher;
pub mod num;
pub mod rect;
pub mod review;
pub mod suppress;
pub mod table;
pub mod worker;


/// Errors that abort a repeat-detection run.
///
/// Geometry faults on individual box pairs are deliberately *not* part of
/// this enum; they are directory-local, logged, and treated as non-matches
/// (see [`rect::IouError`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input table or review index violates the schema this crate relies
    /// on. Continuing would risk suppressing the wrong detections.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    /// Mutually incompatible options. Rejected before any matching work
    /// starts.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// A consistency check failed while rewriting the detection table. This
    /// indicates a logic defect or index corruption, not recoverable data.
    #[error("suppression invariant violated: {0}")]
    SuppressionInvariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and this library will log at *debug* level; everything
/// else follows `RUST_LOG`.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}

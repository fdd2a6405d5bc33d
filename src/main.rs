use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rde::config::{Options, SortOrder, WorkerBackend};
use rde::driver;

/// Finds and removes repeated false-positive detections in detector batch
/// output.
#[derive(Parser)]
#[command(name = "rde", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// First pass: find suspicious locations, suppress them, and write a
    /// review index for manual filtering.
    Find {
        /// Detector output .json file.
        input: PathBuf,

        /// Directory the review folder is created in.
        #[arg(long)]
        output_base: String,

        /// Root of the image tree the table's relative paths resolve against.
        #[arg(long, default_value = "")]
        image_base: String,

        /// Where to write the suppressed table.
        #[arg(long)]
        output: Option<PathBuf>,

        /// IoU threshold for considering two boxes the same location.
        #[arg(long)]
        iou_threshold: Option<f32>,

        /// Occurrences required before a location is considered suspicious.
        #[arg(long)]
        occurrence_threshold: Option<usize>,

        /// Minimum confidence for a detection to be considered.
        #[arg(long)]
        confidence_min: Option<f32>,

        /// Number of matching workers; 0 runs everything inline.
        #[arg(long)]
        workers: Option<usize>,

        /// Review ordering: none, xsort, or clustersort.
        #[arg(long)]
        sort_order: Option<String>,
    },

    /// Second pass: re-load a reviewed index and suppress only the locations
    /// the reviewer confirmed as false positives.
    Remove {
        /// Detector output .json file (the same one the first pass read).
        input: PathBuf,

        /// The detection index written by the first pass.
        review_index: PathBuf,

        /// Where to write the suppressed table.
        output: PathBuf,

        /// Flat text file of accepted artifact names, one per line. Without
        /// it, acceptance is judged by which artifact files still exist.
        #[arg(long)]
        accepted_list: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    rde::init_logger!();

    let cli = Cli::parse();
    match cli.command {
        Command::Find {
            input,
            output_base,
            image_base,
            output,
            iou_threshold,
            occurrence_threshold,
            confidence_min,
            workers,
            sort_order,
        } => {
            let mut options = Options {
                output_base,
                image_base,
                ..Options::default()
            };
            if let Some(iou_threshold) = iou_threshold {
                options.iou_threshold = iou_threshold;
            }
            if let Some(occurrence_threshold) = occurrence_threshold {
                options.occurrence_threshold = occurrence_threshold;
            }
            if let Some(confidence_min) = confidence_min {
                options.confidence_min = confidence_min;
            }
            match workers {
                Some(0) => options.worker_backend = WorkerBackend::Inline,
                Some(n) => options.n_workers = n,
                None => {}
            }
            if let Some(sort_order) = sort_order {
                options.sort_order = match sort_order.as_str() {
                    "none" => SortOrder::None,
                    "xsort" => SortOrder::XSort,
                    "clustersort" => SortOrder::ClusterSort,
                    other => anyhow::bail!("unrecognized sort order `{other}`"),
                };
            }

            let results = driver::find_repeat_detections(&input, output.as_deref(), &options)?;
            println!("{}", results.suppression);
            if let Some(index) = &results.review_index_file {
                println!("review index: {}", index.display());
            }
        }

        Command::Remove {
            input,
            review_index,
            output,
            accepted_list,
        } => {
            let options = Options {
                review_file_to_load: Some(review_index),
                accepted_file_list: accepted_list,
                ..Options::default()
            };
            let results = driver::find_repeat_detections(&input, Some(&output), &options)?;
            println!("{}", results.suppression);
            println!("wrote {}", output.display());
        }
    }

    Ok(())
}

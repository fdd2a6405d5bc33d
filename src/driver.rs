//! End-to-end driver for finding and removing repeat detections.
//!
//! [`find_repeat_detections`] covers both passes of the workflow. Without a
//! review index it runs the compute pass: partition the table by directory,
//! match every directory (in parallel), select and order the suspicious
//! locations, suppress them, and persist the review index. With a review
//! index it runs the reconciliation pass instead: load the prior suspicious
//! set, drop what the reviewer rejected, and suppress only the survivors.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::aggregate;
use crate::config::{parent_dir, DirGrouping, MissingImagePolicy, Options, WorkerBackend};
use crate::matcher::{self, DetectionLocation};
use crate::review::{self, ReviewFeedback, ReviewIndex, REVIEW_INDEX_FILE_NAME};
use crate::suppress::{self, SuppressionStats};
use crate::table::{DetectionTable, ImageRecord};
use crate::worker::{promise, Executor, InlineExecutor, ThreadPool};
use crate::Error;

/// The results of an entire repeat-detection run.
pub struct RunResults {
    /// The detection table after suppression.
    pub table: DetectionTable,
    /// Per-directory suspicious locations; indices align with
    /// `dir_index_to_name`.
    pub suspicious_detections: Vec<Vec<DetectionLocation>>,
    pub dir_index_to_name: BTreeMap<usize, String>,
    pub suppression: SuppressionStats,
    /// The review index written by (or driving) this run, if any.
    pub review_index_file: Option<PathBuf>,
}

/// Runs a compute pass, or a reconciliation pass when
/// `options.review_file_to_load` is set.
///
/// `output` receives the suppressed table, in the input format.
pub fn find_repeat_detections(
    input: &Path,
    output: Option<&Path>,
    options: &Options,
) -> Result<RunResults, Error> {
    options.validate()?;

    match &options.review_file_to_load {
        Some(review_file) => reconcile_run(input, output, options, review_file),
        None => compute_run(input, output, options),
    }
}

/// The per-directory row groups and the row lookup for suppression.
struct Partition {
    /// Directory name and its rows, in first-encounter order.
    directories: Vec<(String, Vec<ImageRecord>)>,
    filename_to_row: HashMap<String, usize>,
}

fn partition_by_directory(table: &DetectionTable, options: &Options) -> Result<Partition, Error> {
    let mut directories: Vec<(String, Vec<ImageRecord>)> = Vec::new();
    let mut dir_positions: HashMap<String, usize> = HashMap::new();
    let mut filename_to_row = HashMap::with_capacity(table.images.len());
    let mut custom_replacements = 0usize;

    for (i_row, record) in table.images.iter().enumerate() {
        let dir_name = match &options.dir_grouping {
            DirGrouping::Custom(_) => {
                let name = options.dir_grouping.dir_name(&record.file);
                if name != parent_dir(&record.file) {
                    custom_replacements += 1;
                }
                name
            }
            DirGrouping::LeafLevels(levels) => {
                if *levels > 0 && parent_dir(&record.file).is_empty() {
                    return Err(Error::CorruptInput(format!(
                        "cannot group {levels} levels up from the flat filename {}",
                        record.file
                    )));
                }
                let name = options.dir_grouping.dir_name(&record.file);
                if *levels > 0 && name.is_empty() {
                    return Err(Error::CorruptInput(format!(
                        "grouping {levels} levels up leaves no directory for {}",
                        record.file
                    )));
                }
                name
            }
        };

        let position = *dir_positions.entry(dir_name.clone()).or_insert_with(|| {
            directories.push((dir_name, Vec::new()));
            directories.len() - 1
        });
        directories[position].1.push(record.clone());

        if filename_to_row.insert(record.file.clone(), i_row).is_some() {
            return Err(Error::CorruptInput(format!(
                "duplicate filename in results: {}",
                record.file
            )));
        }
    }

    if matches!(options.dir_grouping, DirGrouping::Custom(_)) {
        log::info!(
            "custom directory function made {custom_replacements} replacements (of {} images)",
            table.images.len()
        );
    }
    log::info!(
        "separated {} files into {} directories",
        table.images.len(),
        directories.len()
    );

    Ok(Partition {
        directories,
        filename_to_row,
    })
}

/// Runs the per-directory matcher over every directory and collects results
/// in submission order, so the outcome never depends on scheduling.
fn run_matchers(
    directories: Vec<(String, Vec<ImageRecord>)>,
    options: &Options,
) -> Result<Vec<Vec<DetectionLocation>>, Error> {
    let n_dirs = directories.len();
    let mut executor: Box<dyn Executor> = match options.worker_backend {
        WorkerBackend::Inline => Box::new(InlineExecutor),
        WorkerBackend::Threads => {
            let workers = options.n_workers.min(n_dirs.max(1));
            if workers < options.n_workers {
                log::info!(
                    "pool of {} requested, but only {n_dirs} directories; reducing to {workers}",
                    options.n_workers
                );
            }
            Box::new(ThreadPool::new(workers)?)
        }
    };

    let shared_options = Arc::new(options.clone());
    let mut handles = Vec::with_capacity(n_dirs);
    for (dir_name, rows) in directories {
        let (promise, handle) = promise();
        let options = Arc::clone(&shared_options);
        executor.submit(Box::new(move || {
            let result = matcher::find_matches_in_directory(&dir_name, &rows, &options);
            log::debug!("finished matching directory {dir_name}");
            promise.fulfill(result);
        }));
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(n_dirs);
    for handle in handles {
        match handle.block() {
            Ok(result) => results.push(result?),
            Err(_dropped) => {
                // A worker died without fulfilling its promise. Dropping the
                // executor joins the pool, which resumes the worker's panic
                // with its real payload.
                drop(executor);
                return Err(Error::CorruptInput(
                    "a matching worker terminated without a result".into(),
                ));
            }
        }
    }
    Ok(results)
}

fn compute_run(
    input: &Path,
    output: Option<&Path>,
    options: &Options,
) -> Result<RunResults, Error> {
    let mut table = DetectionTable::load_json(input, &options.filename_replacements)?;
    if table.images.is_empty() {
        return Err(Error::CorruptInput(format!(
            "no image rows in {}",
            input.display()
        )));
    }

    if options.write_review_folder && options.output_base.is_empty() {
        return Err(Error::ConfigConflict(
            "writing the review folder requires an output base directory".into(),
        ));
    }

    let partition = partition_by_directory(&table, options)?;
    let mut directories = partition.directories;
    if let Some(max_dirs) = options.debug_max_dirs {
        directories.truncate(max_dirs);
    }

    let dir_index_to_name = directories
        .iter()
        .enumerate()
        .map(|(index, (name, _))| (index, name.clone()))
        .collect::<BTreeMap<_, _>>();

    log::info!("finding similar detections in {} directories", directories.len());
    let all_candidates = run_matchers(directories, options)?;

    let mut suspicious = Vec::with_capacity(all_candidates.len());
    let mut n_locations = 0usize;
    let mut n_instances = 0usize;
    for (dir_index, candidates) in all_candidates.into_iter().enumerate() {
        let mut selected = aggregate::select_suspicious(candidates, options.occurrence_threshold);
        aggregate::sort_for_review(&mut selected, options);
        n_locations += selected.len();
        n_instances += selected.iter().map(|l| l.instances.len()).sum::<usize>();
        log::info!(
            "found {} suspicious locations in directory {dir_index} ({})",
            selected.len(),
            dir_index_to_name[&dir_index]
        );
        suspicious.push(selected);
    }
    log::info!(
        "found {n_locations} unique locations over {n_instances} instances that look suspicious"
    );

    review::assign_sample_file_names(&mut suspicious);

    let suppression =
        suppress::update_detection_table(&mut table, &suspicious, &partition.filename_to_row, options)?;
    log::info!("{suppression}");

    if let Some(path) = output {
        table.write_json(path)?;
    }

    let review_index_file = if options.write_review_folder {
        check_sample_sources(&suspicious, options)?;
        let review_dir = create_review_dir(&options.output_base)?;
        let path = review_dir.join(REVIEW_INDEX_FILE_NAME);
        ReviewIndex {
            suspicious_detections: suspicious.clone(),
            dir_index_to_name: dir_index_to_name.clone(),
            options: options.clone(),
        }
        .save(&path)?;
        Some(path)
    } else {
        None
    };

    Ok(RunResults {
        table,
        suspicious_detections: suspicious,
        dir_index_to_name,
        suppression,
        review_index_file,
    })
}

fn reconcile_run(
    input: &Path,
    output: Option<&Path>,
    caller_options: &Options,
    review_file: &Path,
) -> Result<RunResults, Error> {
    log::info!(
        "bypassing detection finding, loading {}",
        review_file.display()
    );
    let index = ReviewIndex::load(review_file)?;
    let review_dir = review_file.parent().unwrap_or(Path::new("")).to_path_buf();

    // The stored options reproduce the first pass. Only the fields that steer
    // this pass itself come from the caller.
    let mut options = index.options;
    options.review_file_to_load = Some(review_file.to_path_buf());
    options.write_review_folder = false;
    options.accepted_file_list = caller_options.accepted_file_list.clone();
    options.validate()?;

    let mut table = DetectionTable::load_json(input, &options.filename_replacements)?;
    let filename_to_row = table.filename_to_row()?;

    let mut suspicious = index.suspicious_detections;

    let accepted;
    let feedback = match &options.accepted_file_list {
        Some(path) => {
            accepted = review::load_accepted_names(path)?;
            log::info!("loaded {} accepted artifact names", accepted.len());
            ReviewFeedback::AcceptedNames(&accepted)
        }
        None => ReviewFeedback::SurvivingFiles {
            review_dir: &review_dir,
        },
    };
    review::reconcile(&mut suspicious, &feedback);

    let suppression =
        suppress::update_detection_table(&mut table, &suspicious, &filename_to_row, &options)?;
    log::info!("{suppression}");

    if let Some(path) = output {
        table.write_json(path)?;
    }

    Ok(RunResults {
        table,
        suspicious_detections: suspicious,
        dir_index_to_name: index.dir_index_to_name,
        suppression,
        review_index_file: Some(review_file.to_path_buf()),
    })
}

/// Verifies that the source image behind each artifact-to-be exists under the
/// image base, honoring the configured missing-image policy.
fn check_sample_sources(
    suspicious: &[Vec<DetectionLocation>],
    options: &Options,
) -> Result<(), Error> {
    if options.image_base.is_empty() {
        return Ok(());
    }

    let mut warned = false;
    for location in suspicious.iter().flatten() {
        let Some(instance) = location.instances.first() else {
            continue;
        };
        let path = Path::new(&options.image_base).join(&instance.file);
        if path.is_file() {
            continue;
        }
        match options.missing_image_policy {
            MissingImagePolicy::Fatal => {
                return Err(Error::CorruptInput(format!(
                    "missing source image {}",
                    path.display()
                )));
            }
            MissingImagePolicy::Once => {
                if !warned {
                    log::warn!(
                        "missing source image {} (further misses not reported)",
                        path.display()
                    );
                    warned = true;
                }
            }
            MissingImagePolicy::Always => {
                log::warn!("missing source image {}", path.display());
            }
        }
    }
    Ok(())
}

fn create_review_dir(output_base: &str) -> Result<PathBuf, Error> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    let review_dir = Path::new(output_base).join(format!("filtering_{seconds}"));
    fs::create_dir_all(&review_dir)?;
    Ok(review_dir)
}

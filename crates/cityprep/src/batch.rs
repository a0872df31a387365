//! Directory-to-directory batches: one output file per input file, processed in parallel.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::error::{IoContext, Result};

/// One unit of work: turn `input` into `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Where a job writes before its output is moved into place.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

/// Output file name for `file_name`: `input_suffix` (case-insensitive) replaced by `output_suffix`.
pub fn output_name(file_name: &str, input_suffix: &str, output_suffix: &str) -> Option<String> {
    let lower = file_name.to_ascii_lowercase();
    if !lower.ends_with(&input_suffix.to_ascii_lowercase()) || lower.len() == input_suffix.len() {
        return None;
    }
    let stem = &file_name[..file_name.len() - input_suffix.len()];
    Some(format!("{}{}", stem, output_suffix))
}

/// List the files of `input_dir` ending in `input_suffix`, paired with their output path in
/// `output_dir`. Sorted by input path.
pub fn collect_jobs(
    input_dir: &Path,
    input_suffix: &str,
    output_dir: &Path,
    output_suffix: &str,
    recursive: bool,
) -> Result<Vec<Job>> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut jobs = Vec::new();

    for entry in WalkDir::new(input_dir)
        .follow_links(true)
        .max_depth(max_depth)
    {
        let entry = entry.map_err(std::io::Error::from).at(input_dir)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(out_name) = output_name(name, input_suffix, output_suffix) {
            jobs.push(Job {
                input: entry.path().to_path_buf(),
                output: output_dir.join(out_name),
            });
        }
    }

    jobs.sort_by(|a, b| a.input.cmp(&b.input));
    Ok(jobs)
}

/// Whether any job would actually run (its output is missing, or `overwrite` is set).
pub fn has_pending(jobs: &[Job], overwrite: bool) -> bool {
    jobs.iter().any(|job| overwrite || !job.output.exists())
}

/// Outcome counts of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub written: usize,
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.written + self.skipped + self.failed.len()
    }
}

enum Outcome {
    Written,
    Skipped,
    Failed(String),
}

/// Runs jobs on a sized rayon pool. Existing outputs are skipped unless `overwrite`.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    label: String,
    threads: usize,
    overwrite: bool,
    progress: bool,
}

impl BatchRunner {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            threads: 0,
            overwrite: false,
            progress: true,
        }
    }

    /// Worker threads; 0 uses one per CPU.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.green/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏ ");
        pb.set_style(style);
        pb.set_message(self.label.clone());
        pb
    }

    pub fn run<F, E>(&self, jobs: &[Job], work: F) -> Result<BatchReport>
    where
        F: Fn(&Job) -> std::result::Result<(), E> + Sync,
        E: Display,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?;

        info!("{}: processing {} items...", self.label, jobs.len());
        let pb = self.progress_bar(jobs.len());

        let outcomes: Vec<Outcome> = pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    let outcome = if job.output.exists() && !self.overwrite {
                        debug!("Skipping existing file: {}", job.output.display());
                        Outcome::Skipped
                    } else {
                        match work(job) {
                            Ok(()) => {
                                info!("OK {} -> {}", job.input.display(), job.output.display());
                                Outcome::Written
                            }
                            Err(err) => {
                                warn!("Error processing {}: {:#}", job.input.display(), err);
                                Outcome::Failed(format!("{:#}", err))
                            }
                        }
                    };
                    pb.inc(1);
                    outcome
                })
                .collect()
        });
        pb.finish_and_clear();

        let mut report = BatchReport::default();
        for (job, outcome) in jobs.iter().zip(outcomes) {
            match outcome {
                Outcome::Written => report.written += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed(msg) => report.failed.push((job.input.clone(), msg)),
            }
        }

        info!(
            "{}: {} written, {} skipped, {} failed",
            self.label,
            report.written,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cityprep-{}-{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn output_names_replace_suffix() {
        assert_eq!(output_name("a.obj.gz", ".obj.gz", ".binvox").as_deref(), Some("a.binvox"));
        assert_eq!(output_name("B.OBJ", ".obj", ".obj.gz").as_deref(), Some("B.obj.gz"));
        assert_eq!(output_name("a.ply", ".obj", ".obj.gz"), None);
        assert_eq!(output_name(".obj", ".obj", ".obj.gz"), None);
        assert_eq!(
            partial_path(Path::new("/out/a.binvox")),
            PathBuf::from("/out/a.binvox.partial")
        );
    }

    #[test]
    fn collects_matching_files_sorted() {
        let dir = temp_dir("collect");
        for name in ["b.obj", "a.obj", "c.ply", "d.obj.gz"] {
            fs::write(dir.join(name), b"").unwrap();
        }
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/e.obj"), b"").unwrap();

        let out = Path::new("/out");
        let flat = collect_jobs(&dir, ".obj", out, ".obj.gz", false).unwrap();
        assert_eq!(
            flat,
            vec![
                Job { input: dir.join("a.obj"), output: out.join("a.obj.gz") },
                Job { input: dir.join("b.obj"), output: out.join("b.obj.gz") },
            ]
        );

        let deep = collect_jobs(&dir, ".obj", out, ".obj.gz", true).unwrap();
        assert_eq!(deep.len(), 3);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn runner_skips_existing_and_reports_failures() {
        let dir = temp_dir("runner");
        let jobs: Vec<Job> = ["ok", "done", "bad"]
            .iter()
            .map(|n| Job {
                input: dir.join(format!("{n}.in")),
                output: dir.join(format!("{n}.out")),
            })
            .collect();
        fs::write(&jobs[1].output, b"already there").unwrap();
        assert!(has_pending(&jobs, false));
        assert!(!has_pending(&jobs[1..2], false));
        assert!(has_pending(&jobs[1..2], true));

        let report = BatchRunner::new("test")
            .threads(2)
            .progress(false)
            .run(&jobs, |job| {
                if job.input.ends_with("bad.in") {
                    return Err("boom".to_string());
                }
                fs::write(&job.output, b"x").map_err(|e| e.to_string())
            })
            .unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, vec![(jobs[2].input.clone(), "boom".to_string())]);
        assert!(!report.is_success());
        assert_eq!(report.total(), 3);
        assert_eq!(fs::read(&jobs[1].output).unwrap(), b"already there");

        let again = BatchRunner::new("test")
            .overwrite(true)
            .progress(false)
            .run(&jobs[1..2], |job| fs::write(&job.output, b"new").map_err(|e| e.to_string()))
            .unwrap();
        assert_eq!(again.written, 1);
        assert_eq!(fs::read(&jobs[1].output).unwrap(), b"new");

        fs::remove_dir_all(&dir).unwrap();
    }
}

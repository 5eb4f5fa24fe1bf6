use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::command::CommandRunner;
use crate::config::QcSettings;
use crate::domain;
use crate::error::BidsError;
use crate::executor::Executor;
use crate::fs_util;
use crate::logger::SharedLog;
use crate::qc::workflow::{PipelineVariant, QcStats, QcWorkflow, WorkflowResult, WorkflowState};

const MISSING: &str = "None";

/// Converted images below a BIDS root: `<bids>/*/*/*/*.nii*`, sorted.
pub fn discover_images(bids_dir: &Path) -> Result<Vec<PathBuf>, BidsError> {
    let root = glob::Pattern::escape(&bids_dir.to_string_lossy());
    let pattern = format!("{root}/*/*/*/*.nii*");
    let entries = glob::glob(&pattern)
        .map_err(|err| BidsError::Filesystem(format!("invalid pattern {pattern}: {err}")))?;

    let mut images = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| BidsError::Filesystem(err.to_string()))?;
        if path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Keeps the first image for every clean name; later images that would share
/// its working directory and report row are logged and dropped.
pub fn unique_clean_names(images: Vec<PathBuf>, log: &SharedLog) -> Vec<PathBuf> {
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut unique = Vec::with_capacity(images.len());
    for image in images {
        let clean = domain::clean_name(&fs_util::file_name(&image)).to_string();
        match seen.get(&clean) {
            Some(first) => log.error(format!(
                "Image {} has the same name as {} ({clean}). Skipping...",
                image.display(),
                first.display()
            )),
            None => {
                seen.insert(clean, image.clone());
                unique.push(image);
            }
        }
    }
    unique
}

/// One row per image, keyed by clean name.
#[derive(Debug, Clone, PartialEq)]
pub struct QcReport {
    pub variant: PipelineVariant,
    pub rows: BTreeMap<String, Option<QcStats>>,
}

impl QcReport {
    pub fn new(variant: PipelineVariant) -> Self {
        Self {
            variant,
            rows: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, result: WorkflowResult) {
        let stats = result.stats().copied();
        self.rows.insert(result.clean_name, stats);
    }

    pub fn succeeded(&self) -> usize {
        self.rows.values().filter(|row| row.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.rows.len() - self.succeeded()
    }

    pub fn file_name(&self) -> &'static str {
        match self.variant {
            PipelineVariant::Minimal => "TSNR_summaries.csv",
            PipelineVariant::Full => "QC_summaries.csv",
        }
    }

    pub fn header(&self) -> Vec<&'static str> {
        let mut header = vec!["Image", "TSNR"];
        if self.variant == PipelineVariant::Full {
            header.extend([
                "FWHM_pre_x",
                "FWHM_pre_y",
                "FWHM_pre_z",
                "FWHM_pre_combined",
                "FWHM_post_x",
                "FWHM_post_y",
                "FWHM_post_z",
                "FWHM_post_combined",
                "mean_FD",
                "n_FD_above",
                "perc_FD_above",
            ]);
        }
        header
    }

    fn record(&self, name: &str, stats: Option<&QcStats>) -> Vec<String> {
        let width = self.header().len();
        let mut record = vec![name.to_string()];
        let Some(stats) = stats else {
            record.resize(width, MISSING.to_string());
            return record;
        };

        record.push(stats.tsnr.to_string());
        if self.variant == PipelineVariant::Full {
            for fwhm in [stats.fwhm_pre, stats.fwhm_post] {
                match fwhm {
                    Some(f) => record.extend([f.x, f.y, f.z, f.combined].map(|v| v.to_string())),
                    None => record.extend([MISSING; 4].map(str::to_string)),
                }
            }
            match stats.motion {
                Some(fd) => record.extend([
                    fd.mean.to_string(),
                    fd.count_above.to_string(),
                    fd.percent_above.to_string(),
                ]),
                None => record.extend([MISSING; 3].map(str::to_string)),
            }
        }
        record
    }

    pub fn write_csv(&self, output_dir: &Path) -> Result<PathBuf, BidsError> {
        let path = output_dir.join(self.file_name());
        let csv_err = |err: csv::Error| BidsError::Report(format!("{}: {err}", path.display()));

        let mut writer = csv::Writer::from_path(&path).map_err(csv_err)?;
        writer.write_record(self.header()).map_err(csv_err)?;
        for (name, stats) in &self.rows {
            writer
                .write_record(self.record(name, stats.as_ref()))
                .map_err(csv_err)?;
        }
        writer
            .flush()
            .map_err(|err| BidsError::Report(format!("{}: {err}", path.display())))?;
        Ok(path)
    }
}

/// Runs the QC workflow over every converted image.
pub struct QcRun<'a> {
    runner: &'a dyn CommandRunner,
    log: &'a SharedLog,
}

impl<'a> QcRun<'a> {
    pub fn new(runner: &'a dyn CommandRunner, log: &'a SharedLog) -> Self {
        Self { runner, log }
    }

    pub fn run(&self, settings: &QcSettings) -> Result<QcReport, BidsError> {
        fs_util::create_path(&settings.output_dir)?;
        let images = discover_images(&settings.bids_dir)?;
        self.log.info(format!(
            "Found {} images in {}.",
            images.len(),
            settings.bids_dir.display()
        ));
        let images = unique_clean_names(images, self.log);

        let workflow = QcWorkflow::new(self.runner, self.log, settings.variant, settings.fd);
        let executor = Executor::new(settings.workers)?;
        let results = executor.run(images, |image| {
            workflow.run(&image, &settings.output_dir).unwrap_or_else(|err| {
                self.log
                    .error(format!("Could not run QC on {}: {err}", image.display()));
                WorkflowResult {
                    clean_name: domain::clean_name(&fs_util::file_name(&image)).to_string(),
                    state: WorkflowState::Aborted,
                }
            })
        })?;

        let mut report = QcReport::new(settings.variant);
        for result in results {
            report.insert(result);
        }
        self.log.info(format!(
            "QC finished: {} succeeded, {} failed.",
            report.succeeded(),
            report.failed()
        ));
        Ok(report)
    }
}

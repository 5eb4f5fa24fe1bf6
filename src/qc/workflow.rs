//! Per-image QC pipeline.
//!
//! Stages run in a fixed linear order. The first stage that fails ends the
//! run for that image and no statistics are reported for it; a finished run
//! always carries a complete record.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::command::{CommandOutcome, CommandRunner, ToolCommand, run_logged};
use crate::domain;
use crate::error::BidsError;
use crate::fs_util;
use crate::logger::SharedLog;
use crate::qc::stats::{self, FdParams, FdSummary, Fwhm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PipelineVariant {
    /// tSNR only.
    Minimal,
    /// tSNR, FWHM before and after registration, framewise displacement.
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Despike,
    SliceTimingCorrect,
    PreRegFwhm,
    MotionCorrect,
    PostRegFwhm,
    Automask,
    TemporalMean,
    LinearDetrend,
    RecombineMeanWithDetrended,
    ComputeTsnr,
    ParseFwhm,
    ComputeFramewiseDisplacement,
    ExtractFdSummary,
}

const MINIMAL: [Stage; 8] = [
    Stage::Despike,
    Stage::SliceTimingCorrect,
    Stage::MotionCorrect,
    Stage::Automask,
    Stage::TemporalMean,
    Stage::LinearDetrend,
    Stage::RecombineMeanWithDetrended,
    Stage::ComputeTsnr,
];

const FULL: [Stage; 13] = [
    Stage::Despike,
    Stage::SliceTimingCorrect,
    Stage::PreRegFwhm,
    Stage::MotionCorrect,
    Stage::PostRegFwhm,
    Stage::Automask,
    Stage::TemporalMean,
    Stage::LinearDetrend,
    Stage::RecombineMeanWithDetrended,
    Stage::ComputeTsnr,
    Stage::ParseFwhm,
    Stage::ComputeFramewiseDisplacement,
    Stage::ExtractFdSummary,
];

impl Stage {
    pub fn sequence(variant: PipelineVariant) -> &'static [Stage] {
        match variant {
            PipelineVariant::Minimal => &MINIMAL,
            PipelineVariant::Full => &FULL,
        }
    }

    /// Stages backed by an external AFNI program.
    pub fn is_external(self) -> bool {
        matches!(
            self,
            Stage::Despike
                | Stage::SliceTimingCorrect
                | Stage::PreRegFwhm
                | Stage::MotionCorrect
                | Stage::PostRegFwhm
                | Stage::Automask
                | Stage::TemporalMean
                | Stage::LinearDetrend
                | Stage::RecombineMeanWithDetrended
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Despike => "despike",
            Stage::SliceTimingCorrect => "slice-timing correction",
            Stage::PreRegFwhm => "pre-registration FWHM",
            Stage::MotionCorrect => "motion correction",
            Stage::PostRegFwhm => "post-registration FWHM",
            Stage::Automask => "automask",
            Stage::TemporalMean => "temporal mean",
            Stage::LinearDetrend => "linear detrend",
            Stage::RecombineMeanWithDetrended => "mean recombination",
            Stage::ComputeTsnr => "tSNR",
            Stage::ParseFwhm => "FWHM parsing",
            Stage::ComputeFramewiseDisplacement => "framewise displacement",
            Stage::ExtractFdSummary => "FD summary",
        };
        f.write_str(name)
    }
}

/// Every file the pipeline reads or writes for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPaths {
    pub clean_name: String,
    pub input: PathBuf,
    pub workdir: PathBuf,
    pub despike: PathBuf,
    pub tshift: PathBuf,
    pub fwhm_pre_1d: PathBuf,
    pub fwhm_pre: PathBuf,
    pub motion: PathBuf,
    pub affine: PathBuf,
    pub max_displacement: PathBuf,
    pub volreg: PathBuf,
    pub fwhm_post_1d: PathBuf,
    pub fwhm_post: PathBuf,
    pub mask: PathBuf,
    pub mean: PathBuf,
    pub detrend: PathBuf,
    pub detrend_with_mean: PathBuf,
    pub fd: PathBuf,
}

impl WorkflowPaths {
    /// Lays out `<output_dir>/<clean_name>/...` for `input`, which must be a
    /// `.nii` or `.nii.gz` image.
    pub fn new(input: &Path, output_dir: &Path) -> Result<Self, BidsError> {
        let file_name = fs_util::file_name(input);
        if !file_name.contains(".nii") {
            return Err(BidsError::InvalidImageName(input.to_path_buf()));
        }
        let clean_name = domain::clean_name(&file_name).to_string();
        let workdir = output_dir.join(&clean_name);

        let base = workdir.join(&clean_name).to_string_lossy().into_owned();
        let despike = format!("{base}_despike");
        let tshift = format!("{despike}_tshift");
        let volreg = format!("{tshift}_volreg");
        let nii = |stem: &str| PathBuf::from(format!("{stem}.nii.gz"));

        Ok(Self {
            input: input.to_path_buf(),
            despike: nii(&despike),
            tshift: nii(&tshift),
            fwhm_pre_1d: PathBuf::from(format!("{tshift}_fwhm_pre.1D")),
            fwhm_pre: PathBuf::from(format!("{tshift}_fwhm_pre.txt")),
            motion: PathBuf::from(format!("{tshift}.1D")),
            affine: PathBuf::from(format!("{tshift}.aff12.1D")),
            max_displacement: PathBuf::from(format!("{tshift}_md.1D")),
            volreg: nii(&volreg),
            fwhm_post_1d: PathBuf::from(format!("{volreg}_fwhm_post.1D")),
            fwhm_post: PathBuf::from(format!("{volreg}_fwhm_post.txt")),
            mask: nii(&format!("{volreg}_mask")),
            mean: nii(&format!("{volreg}_mean")),
            detrend: nii(&format!("{volreg}_detrend")),
            detrend_with_mean: nii(&format!("{volreg}_detrend_with_mean")),
            fd: PathBuf::from(format!("{tshift}_fd.1D")),
            clean_name,
            workdir,
        })
    }

    /// The AFNI invocation for an external stage.
    pub fn command(&self, stage: Stage) -> Option<ToolCommand> {
        let cmd = match stage {
            Stage::Despike => ToolCommand::new("3dDespike")
                .arg("-overwrite")
                .arg("-prefix")
                .path_arg(&self.despike)
                .path_arg(&self.input),
            Stage::SliceTimingCorrect => ToolCommand::new("3dTshift")
                .arg("-overwrite")
                .arg("-prefix")
                .path_arg(&self.tshift)
                .path_arg(&self.despike),
            Stage::PreRegFwhm => fwhm_command(&self.tshift, &self.fwhm_pre_1d),
            Stage::MotionCorrect => ToolCommand::new("3dvolreg")
                .arg("-overwrite")
                .arg("-twopass")
                .arg("-heptic")
                .arg("-base")
                .arg("3")
                .arg("-zpad")
                .arg("4")
                .arg("-1Dfile")
                .path_arg(&self.motion)
                .arg("-1Dmatrix_save")
                .path_arg(&self.affine)
                .arg("-maxdisp1D")
                .path_arg(&self.max_displacement)
                .arg("-prefix")
                .path_arg(&self.volreg)
                .path_arg(&self.tshift),
            Stage::PostRegFwhm => fwhm_command(&self.volreg, &self.fwhm_post_1d),
            Stage::Automask => ToolCommand::new("3dAutomask")
                .arg("-overwrite")
                .arg("-dilate")
                .arg("1")
                .arg("-prefix")
                .path_arg(&self.mask)
                .path_arg(&self.volreg),
            Stage::TemporalMean => ToolCommand::new("3dTstat")
                .arg("-overwrite")
                .arg("-mean")
                .arg("-prefix")
                .path_arg(&self.mean)
                .path_arg(&self.volreg),
            Stage::LinearDetrend => ToolCommand::new("3dDetrend")
                .arg("-overwrite")
                .arg("-polort")
                .arg("1")
                .arg("-prefix")
                .path_arg(&self.detrend)
                .path_arg(&self.volreg),
            Stage::RecombineMeanWithDetrended => ToolCommand::new("3dcalc")
                .arg("-overwrite")
                .arg("-a")
                .path_arg(&self.mean)
                .arg("-b")
                .path_arg(&self.detrend)
                .arg("-expr")
                .arg("a+b")
                .arg("-prefix")
                .path_arg(&self.detrend_with_mean),
            Stage::ComputeTsnr
            | Stage::ParseFwhm
            | Stage::ComputeFramewiseDisplacement
            | Stage::ExtractFdSummary => return None,
        };
        Some(cmd)
    }

    fn captured_output(&self, stage: Stage) -> Option<&Path> {
        match stage {
            Stage::PreRegFwhm => Some(&self.fwhm_pre),
            Stage::PostRegFwhm => Some(&self.fwhm_post),
            _ => None,
        }
    }
}

fn fwhm_command(input: &Path, out: &Path) -> ToolCommand {
    ToolCommand::new("3dFWHMx")
        .arg("-overwrite")
        .arg("-automask")
        .arg("-input")
        .path_arg(input)
        .arg("-out")
        .path_arg(out)
}

/// Statistics of one successfully processed image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QcStats {
    pub tsnr: f64,
    pub fwhm_pre: Option<Fwhm>,
    pub fwhm_post: Option<Fwhm>,
    pub motion: Option<FdSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkflowState {
    Pending,
    Running(Stage),
    Succeeded(QcStats),
    Failed { stage: Stage },
    /// The working directory could not be set up, so no stage ran.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowResult {
    pub clean_name: String,
    pub state: WorkflowState,
}

impl WorkflowResult {
    /// All statistics, or `None` if any stage failed.
    pub fn stats(&self) -> Option<&QcStats> {
        match &self.state {
            WorkflowState::Succeeded(stats) => Some(stats),
            _ => None,
        }
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self.state {
            WorkflowState::Failed { stage } => Some(stage),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Partial {
    tsnr: Option<f64>,
    fwhm_pre: Option<Fwhm>,
    fwhm_post: Option<Fwhm>,
    motion: Option<FdSummary>,
}

impl Partial {
    fn finish(self, variant: PipelineVariant) -> Option<QcStats> {
        let tsnr = self.tsnr?;
        match variant {
            PipelineVariant::Minimal => Some(QcStats {
                tsnr,
                fwhm_pre: None,
                fwhm_post: None,
                motion: None,
            }),
            PipelineVariant::Full => Some(QcStats {
                tsnr,
                fwhm_pre: Some(self.fwhm_pre?),
                fwhm_post: Some(self.fwhm_post?),
                motion: Some(self.motion?),
            }),
        }
    }
}

pub struct QcWorkflow<'a> {
    runner: &'a dyn CommandRunner,
    log: &'a SharedLog,
    variant: PipelineVariant,
    fd: FdParams,
}

impl<'a> QcWorkflow<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        log: &'a SharedLog,
        variant: PipelineVariant,
        fd: FdParams,
    ) -> Self {
        Self {
            runner,
            log,
            variant,
            fd,
        }
    }

    /// Processes one image inside `<output_dir>/<clean_name>`.
    ///
    /// Only an unusable input name or an uncreatable working directory is an
    /// error; stage failures are reported through the result.
    pub fn run(&self, input: &Path, output_dir: &Path) -> Result<WorkflowResult, BidsError> {
        let paths = WorkflowPaths::new(input, output_dir)?;
        fs_util::create_path(&paths.workdir)?;
        let state = self.run_stages(&paths);
        Ok(WorkflowResult {
            clean_name: paths.clean_name,
            state,
        })
    }

    fn run_stages(&self, paths: &WorkflowPaths) -> WorkflowState {
        let mut partial = Partial::default();
        let mut state = WorkflowState::Pending;

        for &stage in Stage::sequence(self.variant) {
            state = WorkflowState::Running(stage);
            let completed = if stage.is_external() {
                self.external(stage, paths)
            } else {
                self.internal(stage, paths, &mut partial)
            };
            if !completed {
                self.log.error(format!(
                    "QC workflow for {} stopped at {stage}; no statistics will be reported.",
                    paths.clean_name
                ));
                return WorkflowState::Failed { stage };
            }
        }

        let last = match state {
            WorkflowState::Running(stage) => stage,
            _ => Stage::Despike,
        };
        match partial.finish(self.variant) {
            Some(stats) => WorkflowState::Succeeded(stats),
            None => WorkflowState::Failed { stage: last },
        }
    }

    fn external(&self, stage: Stage, paths: &WorkflowPaths) -> bool {
        let Some(command) = paths.command(stage) else {
            return false;
        };
        let CommandOutcome::Succeeded(output) =
            run_logged(self.runner, &command, &paths.workdir, self.log)
        else {
            return false;
        };
        if let Some(capture) = paths.captured_output(stage) {
            if let Err(err) = fs::write(capture, &output.stdout) {
                self.log.error(format!(
                    "Could not save {stage} output to {}: {err}",
                    capture.display()
                ));
                return false;
            }
        }
        true
    }

    fn internal(&self, stage: Stage, paths: &WorkflowPaths, partial: &mut Partial) -> bool {
        let result = match stage {
            Stage::ComputeTsnr => stats::compute_tsnr(&paths.detrend_with_mean, &paths.mask)
                .map(|value| partial.tsnr = Some(value)),
            Stage::ParseFwhm => stats::parse_fwhm(&paths.fwhm_pre).and_then(|pre| {
                let post = stats::parse_fwhm(&paths.fwhm_post)?;
                partial.fwhm_pre = Some(pre);
                partial.fwhm_post = Some(post);
                Ok(())
            }),
            Stage::ComputeFramewiseDisplacement => stats::read_affines(&paths.affine)
                .and_then(|rows| stats::framewise_displacement(&rows, self.fd.radius))
                .and_then(|values| stats::write_fd(&paths.fd, &values)),
            Stage::ExtractFdSummary => stats::read_fd(&paths.fd).and_then(|values| {
                partial.motion = stats::summarize_fd(&values, self.fd.cutoff);
                partial.motion.map(|_| ()).ok_or_else(|| BidsError::MalformedMotion {
                    path: paths.fd.clone(),
                    message: "no displacement values".to_string(),
                })
            }),
            _ => return false,
        };

        match result {
            Ok(()) => {
                self.log.debug(format!("{stage} finished for {}", paths.clean_name));
                true
            }
            Err(err) => {
                self.log
                    .error(format!("Error computing {stage} for {}: {err}", paths.clean_name));
                false
            }
        }
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use approx::assert_relative_eq;
use ndarray::{Array3, Array4};
use nifti::writer::WriterOptions;

use oxygen_bids::command::{CommandOutput, CommandRunner, ToolCommand};
use oxygen_bids::config::QcSettings;
use oxygen_bids::error::BidsError;
use oxygen_bids::executor::Workers;
use oxygen_bids::logger::{MemoryWriter, SharedLog};
use oxygen_bids::qc::{FdParams, PipelineVariant, QcRun, QcWorkflow, Stage, WorkflowState};

const IDENTITY: &str = "1 0 0 0 0 1 0 0 0 0 1 0";
const SHIFTED: &str = "1 0 0 0.3 0 1 0 0 0 0 1 0";

type FailRule = Box<dyn Fn(&ToolCommand) -> bool + Send + Sync>;

/// Stands in for AFNI: records every program, writes the files later stages
/// read and fails whenever `fail_when` says so.
struct FakeAfni {
    calls: Mutex<Vec<String>>,
    fail_when: FailRule,
}

impl FakeAfni {
    fn new() -> Self {
        Self::failing(Box::new(|_| false))
    }

    fn failing(fail_when: FailRule) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_when,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn value_after(command: &ToolCommand, flag: &str) -> PathBuf {
    let index = command.args.iter().position(|arg| arg == flag).unwrap();
    PathBuf::from(&command.args[index + 1])
}

fn write_series(path: &Path) {
    let mut series = Array4::<f32>::zeros((2, 2, 2, 4));
    for (index, value) in series.iter_mut().enumerate() {
        *value = if index % 4 % 2 == 0 { 10.0 } else { 12.0 };
    }
    WriterOptions::new(path).write_nifti(&series).unwrap();
}

fn write_mask(path: &Path) {
    let mut mask = Array3::<f32>::zeros((2, 2, 2));
    mask[[0, 0, 0]] = 1.0;
    mask[[1, 1, 1]] = 1.0;
    WriterOptions::new(path).write_nifti(&mask).unwrap();
}

impl CommandRunner for FakeAfni {
    fn run(&self, command: &ToolCommand, _cwd: &Path) -> Result<CommandOutput, BidsError> {
        self.calls.lock().unwrap().push(command.program.clone());
        if (self.fail_when)(command) {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "** FATAL ERROR: simulated".to_string(),
            });
        }

        let mut stdout = String::new();
        match command.program.as_str() {
            "3dFWHMx" => stdout.push_str("# old-style FWHM parameters\n 5.1 5.2 5.3 5.2\n"),
            "3dvolreg" => {
                let affine = value_after(command, "-1Dmatrix_save");
                fs::write(affine, format!("# 3dvolreg matrices\n{IDENTITY}\n{SHIFTED}\n")).unwrap();
            }
            "3dAutomask" => write_mask(&value_after(command, "-prefix")),
            "3dcalc" => write_series(&value_after(command, "-prefix")),
            _ => {}
        }
        Ok(CommandOutput {
            code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

fn bids_tree(root: &Path, names: &[&str]) {
    let func = root.join("sub-0001/ses-0001/func");
    fs::create_dir_all(&func).unwrap();
    for name in names {
        fs::write(func.join(name), b"").unwrap();
        fs::write(func.join(name.replace(".nii.gz", ".json")), b"{}").unwrap();
    }
}

fn settings(root: &Path, variant: PipelineVariant, workers: Workers) -> QcSettings {
    let mut settings = QcSettings::new(root.join("bids"), root.join("qc"));
    settings.variant = variant;
    settings.workers = workers;
    settings
}

fn quiet_log() -> SharedLog {
    SharedLog::from_writer(Box::new(MemoryWriter::new()))
}

#[test]
fn full_pipeline_reports_every_statistic() {
    let temp = tempfile::tempdir().unwrap();
    bids_tree(&temp.path().join("bids"), &["sub-0001_ses-0001_task-fmri_run-0001_bold.nii.gz"]);
    let runner = FakeAfni::new();
    let log = quiet_log();

    let settings = settings(temp.path(), PipelineVariant::Full, Workers::SEQUENTIAL);
    let report = QcRun::new(&runner, &log).run(&settings).unwrap();

    let stats = report.rows["sub-0001_ses-0001_task-fmri_run-0001_bold"].unwrap();
    assert_relative_eq!(stats.tsnr, 11.0, epsilon = 1e-4);
    assert_relative_eq!(stats.fwhm_pre.unwrap().x, 5.1);
    assert_relative_eq!(stats.fwhm_post.unwrap().combined, 5.2);
    let motion = stats.motion.unwrap();
    assert_relative_eq!(motion.mean, 0.15, epsilon = 1e-9);
    assert_eq!(motion.count_above, 1);
    assert_relative_eq!(motion.percent_above, 50.0, epsilon = 1e-9);

    let workdir = temp.path().join("qc/sub-0001_ses-0001_task-fmri_run-0001_bold");
    assert!(workdir.is_dir());
    assert!(workdir
        .join("sub-0001_ses-0001_task-fmri_run-0001_bold_despike_tshift_fd.1D")
        .is_file());

    let summary = report.write_csv(&settings.output_dir).unwrap();
    let text = fs::read_to_string(summary).unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(!text.contains("None"));
}

#[test]
fn failing_stage_stops_the_pipeline() {
    let temp = tempfile::tempdir().unwrap();
    let image = temp.path().join("bold.nii.gz");
    fs::write(&image, b"").unwrap();
    let runner = FakeAfni::failing(Box::new(|cmd| cmd.program == "3dvolreg"));
    let log = quiet_log();

    let workflow = QcWorkflow::new(&runner, &log, PipelineVariant::Full, FdParams::default());
    let result = workflow.run(&image, &temp.path().join("qc")).unwrap();

    assert_eq!(runner.calls(), vec!["3dDespike", "3dTshift", "3dFWHMx", "3dvolreg"]);
    assert_eq!(result.failed_stage(), Some(Stage::MotionCorrect));
    assert!(result.stats().is_none());
}

#[test]
fn internal_stage_failure_is_terminal() {
    let temp = tempfile::tempdir().unwrap();
    let image = temp.path().join("bold.nii");
    fs::write(&image, b"").unwrap();
    // No mask gets written, so tSNR cannot be computed.
    let runner_without_mask = Maskless(FakeAfni::new());
    let log = quiet_log();

    let workflow = QcWorkflow::new(
        &runner_without_mask,
        &log,
        PipelineVariant::Full,
        FdParams::default(),
    );
    let result = workflow.run(&image, &temp.path().join("qc")).unwrap();

    assert_eq!(result.state, WorkflowState::Failed { stage: Stage::ComputeTsnr });
    assert_eq!(runner_without_mask.0.calls().len(), 9);
}

struct Maskless(FakeAfni);

impl CommandRunner for Maskless {
    fn run(&self, command: &ToolCommand, cwd: &Path) -> Result<CommandOutput, BidsError> {
        if command.program == "3dAutomask" {
            self.0.calls.lock().unwrap().push(command.program.clone());
            return Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
        }
        self.0.run(command, cwd)
    }
}

#[test]
fn minimal_variant_skips_fwhm_and_motion() {
    let temp = tempfile::tempdir().unwrap();
    bids_tree(&temp.path().join("bids"), &["a_bold.nii.gz"]);
    let runner = FakeAfni::new();
    let log = quiet_log();

    let settings = settings(temp.path(), PipelineVariant::Minimal, Workers::SEQUENTIAL);
    let report = QcRun::new(&runner, &log).run(&settings).unwrap();

    assert!(!runner.calls().iter().any(|program| program == "3dFWHMx"));
    let stats = report.rows["a_bold"].unwrap();
    assert!(stats.fwhm_pre.is_none() && stats.motion.is_none());

    let summary = report.write_csv(&settings.output_dir).unwrap();
    assert!(summary.ends_with("TSNR_summaries.csv"));
}

#[test]
fn parallel_and_sequential_reports_agree() {
    let names = ["a_bold.nii.gz", "b_bad_bold.nii.gz", "c_bold.nii.gz", "d_bad_bold.nii.gz"];
    let fails_bad = || -> FailRule {
        Box::new(|cmd: &ToolCommand| {
            cmd.program == "3dTshift" && cmd.args.iter().any(|arg| arg.contains("_bad_"))
        })
    };

    let run = |workers: Workers| {
        let temp = tempfile::tempdir().unwrap();
        bids_tree(&temp.path().join("bids"), &names);
        let runner = FakeAfni::failing(fails_bad());
        let log = quiet_log();
        let settings = settings(temp.path(), PipelineVariant::Full, workers);
        let report = QcRun::new(&runner, &log).run(&settings).unwrap();
        let summary = report.write_csv(&settings.output_dir).unwrap();
        (report, fs::read_to_string(summary).unwrap())
    };

    let (sequential, sequential_csv) = run(Workers::SEQUENTIAL);
    let (parallel, parallel_csv) = run(Workers::new(4));

    assert_eq!(sequential, parallel);
    assert_eq!(sequential_csv, parallel_csv);
    assert_eq!(sequential.failed(), 2);
    assert!(sequential_csv.lines().nth(2).unwrap().starts_with("b_bad_bold,None,"));
}

#[test]
fn images_sharing_a_clean_name_get_one_row() {
    let temp = tempfile::tempdir().unwrap();
    bids_tree(&temp.path().join("bids"), &["x_bold.nii.gz"]);
    fs::write(temp.path().join("bids/sub-0001/ses-0001/func/x_bold.nii"), b"").unwrap();
    let runner = FakeAfni::new();
    let memory = MemoryWriter::new();
    let log = SharedLog::from_writer(Box::new(memory.clone()));

    let settings = settings(temp.path(), PipelineVariant::Minimal, Workers::SEQUENTIAL);
    let report = QcRun::new(&runner, &log).run(&settings).unwrap();

    assert_eq!(report.rows.len(), 1);
    assert!(report.rows["x_bold"].is_some());
    let despikes = runner.calls().iter().filter(|program| *program == "3dDespike").count();
    assert_eq!(despikes, 1);
    assert!(memory.contents().contains("x_bold.nii.gz has the same name"));
}

#[test]
fn unusable_workdir_yields_a_failed_row() {
    let temp = tempfile::tempdir().unwrap();
    bids_tree(&temp.path().join("bids"), &["a_bold.nii.gz"]);
    fs::create_dir_all(temp.path().join("qc")).unwrap();
    // a plain file where the working directory should go
    fs::write(temp.path().join("qc/a_bold"), b"").unwrap();
    let runner = FakeAfni::new();
    let memory = MemoryWriter::new();
    let log = SharedLog::from_writer(Box::new(memory.clone()));

    let settings = settings(temp.path(), PipelineVariant::Full, Workers::SEQUENTIAL);
    let report = QcRun::new(&runner, &log).run(&settings).unwrap();

    assert_eq!(report.rows["a_bold"], None);
    assert_eq!(report.failed(), 1);
    assert!(runner.calls().is_empty());
    assert!(memory.contents().contains("Could not run QC"));
}

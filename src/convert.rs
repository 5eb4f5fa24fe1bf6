use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;

use crate::command::{CommandOutput, CommandRunner, ToolCommand};
use crate::domain::ConversionTool;
use crate::error::BidsError;
use crate::fs_util;
use crate::logger::SharedLog;
use crate::mapping::WorkItem;
use crate::series;

const DIMON_QUIT_MARKER: &str = "to3d kept from going into interactive mode by option -quit_on_err";
const DCM2NIIX_LEFTOVERS: [&str; 2] = ["*.nii.gz", "*.json"];
const DIMON_LEFTOVERS: [&str; 2] = ["GERT_Reco_dicom*", "dimon.files.run.*"];

/// Converts one scan directory into a BIDS image with an external tool.
pub struct Converter<'a> {
    tool: ConversionTool,
    runner: &'a dyn CommandRunner,
    log: &'a SharedLog,
    sidecar: bool,
}

impl<'a> Converter<'a> {
    pub fn new(tool: ConversionTool, runner: &'a dyn CommandRunner, log: &'a SharedLog) -> Self {
        Self {
            tool,
            runner,
            log,
            sidecar: true,
        }
    }

    /// Skip the JSON sidecar (dcm2niix `-b y`).
    pub fn without_sidecar(mut self) -> Self {
        self.sidecar = false;
        self
    }

    pub fn command(&self, item: &WorkItem) -> ToolCommand {
        match self.tool {
            ConversionTool::Dcm2niix => {
                let mut cmd = ToolCommand::new("dcm2niix").arg("-z").arg("y");
                if self.sidecar {
                    cmd = cmd.arg("-b").arg("y");
                }
                cmd.arg("-f")
                    .arg(item.output_name.as_str())
                    .path_arg(&item.source_dir)
            }
            ConversionTool::Dimon => ToolCommand::new("Dimon")
                .arg("-infile_pattern")
                .path_arg(&item.source_dir.join("*.dcm"))
                .arg("-gert_create_dataset")
                .arg("-gert_quit_on_err")
                .arg("-gert_to3d_prefix")
                .arg(format!("{}.nii.gz", item.output_name))
                .env("AFNI_TO3D_OUTLIERS", "No"),
        }
    }

    /// Runs the conversion and returns the image path relative to the BIDS
    /// root, or `None` when anything failed. Tool leftovers in the scan
    /// directory are removed either way.
    pub fn convert(&self, item: &WorkItem) -> Option<Utf8PathBuf> {
        let command = self.command(item);
        let result = self.attempt(item, &command);
        self.cleanup(&item.source_dir);
        match result {
            Ok(output) => {
                let first_dcm = series::dicom_files(&item.source_dir)
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| item.source_dir.clone());
                let mut record = format!(
                    "Converted {} to {}\nCommand:\n{command}\nReturn Code:\n0\n\n",
                    first_dcm.display(),
                    item.output_name
                );
                append_output(&mut record, &output.combined());
                self.log.info(record);
                Some(item.relative_path.clone())
            }
            Err(failure) => {
                let mut record = format!(
                    "Error running {} on DICOM series in {} directory.\nCommand:\n{command}\nReturn Code:\n{}\n\n",
                    self.tool,
                    item.source_dir.display(),
                    failure.code
                );
                append_output(&mut record, &failure.output);
                self.log.error(record);
                None
            }
        }
    }

    fn attempt(&self, item: &WorkItem, command: &ToolCommand) -> Result<CommandOutput, Failure> {
        fs_util::create_path(&item.output_dir).map_err(Failure::from_error)?;
        let output = self
            .runner
            .run(command, &item.source_dir)
            .map_err(Failure::from_error)?;
        if !output.success() {
            return Err(Failure::from_output(&output));
        }

        match self.tool {
            ConversionTool::Dcm2niix => {
                let actual = dcm2niix_output_name(&output.combined())
                    .ok_or_else(|| {
                        BidsError::MissingToolOutput {
                            tool: self.tool.to_string(),
                        }
                    })
                    .map_err(Failure::from_error)?;
                self.collect(&item.source_dir, &actual, item, "nii.gz")?;
                if self.sidecar {
                    self.collect(&item.source_dir, &actual, item, "json")?;
                }
            }
            ConversionTool::Dimon => {
                if output.combined().contains(DIMON_QUIT_MARKER) {
                    return Err(Failure::from_output(&output));
                }
                self.collect(&item.source_dir, &item.output_name, item, "nii.gz")?;
            }
        }
        Ok(output)
    }

    fn collect(
        &self,
        source_dir: &Path,
        produced: &str,
        item: &WorkItem,
        extension: &str,
    ) -> Result<(), Failure> {
        let from = source_dir.join(format!("{produced}.{extension}"));
        let to: PathBuf = item
            .output_dir
            .join(format!("{}.{extension}", item.output_name));
        fs_util::move_file(&from, &to).map_err(Failure::from_error)
    }

    fn cleanup(&self, source_dir: &Path) {
        let patterns: &[&str] = match self.tool {
            ConversionTool::Dcm2niix => &DCM2NIIX_LEFTOVERS,
            ConversionTool::Dimon => &DIMON_LEFTOVERS,
        };
        if let Err(err) = fs_util::remove_matching(source_dir, patterns) {
            self.log.warning(format!(
                "Could not clean temporary files in {}: {err}",
                source_dir.display()
            ));
        }
    }
}

struct Failure {
    code: String,
    output: String,
}

impl Failure {
    fn from_output(output: &CommandOutput) -> Self {
        Self {
            code: output
                .code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "terminated by signal".to_string()),
            output: output.combined(),
        }
    }

    fn from_error(err: BidsError) -> Self {
        Self {
            code: "n/a".to_string(),
            output: err.to_string(),
        }
    }
}

fn append_output(record: &mut String, output: &str) {
    if !output.trim().is_empty() {
        record.push_str(&format!("Output:\n{output}\n\n"));
    }
}

/// dcm2niix may decorate the requested name (echo, phase, coil suffixes); the
/// real one is the absolute path on its `Convert` line.
pub fn dcm2niix_output_name(output: &str) -> Option<String> {
    let line = output.lines().find(|line| line.contains("Convert"))?;
    let path = line.split(' ').find(|token| token.starts_with('/'))?;
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

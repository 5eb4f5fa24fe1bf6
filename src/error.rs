use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BidsError {
    #[error("{0} is not a supported conversion tool, select 'dcm2niix' or 'dimon'")]
    #[diagnostic(code(oxybids::config::tool))]
    UnsupportedTool(String),

    #[error("the BIDS directory {0} is not empty and overwrite is disabled")]
    #[diagnostic(
        code(oxybids::config::duplicate),
        help("pass --overwrite to replace existing content")
    )]
    DuplicateContent(PathBuf),

    #[error("{0} is not a valid tar/gzip file")]
    InvalidArchive(PathBuf),

    #[error("{0} is not a NIfTI (.nii) or compressed NIfTI (.nii.gz) file")]
    InvalidImageName(PathBuf),

    #[error("failed to read filter file at {0}")]
    FilterRead(PathBuf),

    #[error("failed to parse filter file: {0}")]
    FilterParse(String),

    #[error("failed to read mapping guide at {0}")]
    MappingGuideRead(PathBuf),

    #[error("failed to parse mapping guide: {0}")]
    MappingGuideParse(String),

    #[error("invalid scan identity: {0}")]
    InvalidIdentity(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("failed to launch {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{tool} did not report an output file name")]
    MissingToolOutput { tool: String },

    #[error("failed to read NIfTI image {path}: {message}")]
    Nifti { path: PathBuf, message: String },

    #[error("brain mask {0} selects no voxels")]
    EmptyMask(PathBuf),

    #[error("image shapes differ: {0}")]
    ShapeMismatch(String),

    #[error("malformed FWHM output in {0}")]
    MalformedFwhm(PathBuf),

    #[error("malformed motion file {path}: {message}")]
    MalformedMotion { path: PathBuf, message: String },

    #[error("affine transform for frame {0} is not invertible")]
    SingularTransform(usize),

    #[error("failed to write report: {0}")]
    Report(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BidsError {
    /// Errors raised before any work is scheduled.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            BidsError::UnsupportedTool(_)
                | BidsError::DuplicateContent(_)
                | BidsError::FilterRead(_)
                | BidsError::FilterParse(_)
                | BidsError::MappingGuideRead(_)
                | BidsError::MappingGuideParse(_)
                | BidsError::WorkerPool(_)
        )
    }
}

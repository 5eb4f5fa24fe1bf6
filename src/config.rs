use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::ConversionTool;
use crate::error::BidsError;
use crate::executor::Workers;
use crate::fs_util::ListingOrder;
use crate::qc::{FdParams, PipelineVariant};

/// Series filters keyed by kind. Only `sequences` is acted upon.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequences: Option<Vec<String>>,
    #[serde(flatten)]
    pub unrecognized: BTreeMap<String, serde_json::Value>,
}

impl FilterSpec {
    pub fn sequences(names: &[&str]) -> Self {
        Self {
            sequences: Some(names.iter().map(|name| name.to_string()).collect()),
            unrecognized: BTreeMap::new(),
        }
    }

    /// `{}` filters nothing.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_none() && self.unrecognized.is_empty()
    }

    pub fn allows_sequence(&self, name: &str) -> bool {
        match &self.sequences {
            Some(allowed) => allowed.iter().any(|candidate| candidate == name),
            None => true,
        }
    }
}

pub struct FilterLoader;

impl FilterLoader {
    pub fn load(path: &Path) -> Result<FilterSpec, BidsError> {
        let content =
            fs::read_to_string(path).map_err(|_| BidsError::FilterRead(path.to_path_buf()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<FilterSpec, BidsError> {
        let spec: FilterSpec =
            serde_json::from_str(content).map_err(|err| BidsError::FilterParse(err.to_string()))?;
        for kind in spec.unrecognized.keys() {
            tracing::warn!("ignoring unsupported filter kind '{kind}'");
        }
        Ok(spec)
    }
}

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub bids_dir: PathBuf,
    pub oxygen_dir: PathBuf,
    pub mapping_guide: Option<PathBuf>,
    pub tool: ConversionTool,
    pub workers: Workers,
    pub overwrite: bool,
    pub filters: Option<FilterSpec>,
    pub scanner_meta: bool,
    pub order: ListingOrder,
}

impl ConversionSettings {
    pub fn new(bids_dir: impl Into<PathBuf>, oxygen_dir: impl Into<PathBuf>) -> Self {
        Self {
            bids_dir: bids_dir.into(),
            oxygen_dir: oxygen_dir.into(),
            mapping_guide: None,
            tool: ConversionTool::Dcm2niix,
            workers: Workers::default(),
            overwrite: false,
            filters: None,
            scanner_meta: false,
            order: ListingOrder::Sorted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QcSettings {
    pub bids_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workers: Workers,
    pub variant: PipelineVariant,
    pub fd: FdParams,
}

impl QcSettings {
    pub fn new(bids_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            bids_dir: bids_dir.into(),
            output_dir: output_dir.into(),
            workers: Workers::default(),
            variant: PipelineVariant::Full,
            fd: FdParams::default(),
        }
    }
}

//! Subject → session → scan mapping from raw oxygen directories to BIDS ids.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::config::FilterSpec;
use crate::domain::{BidsIndex, ScanIdentity, ScanKey, Sequence, SessionKey, SubjectKey};
use crate::error::BidsError;
use crate::fs_util::{self, ListingOrder};
use crate::logger::SharedLog;
use crate::series::{self, SeriesInspector};

const SCAN_MARKER: &str = "mr_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mapping {
    pub subjects: BTreeMap<SubjectKey, Subject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "bids_subject")]
    pub bids_id: BidsIndex,
    pub sessions: BTreeMap<SessionKey, Session>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "bids_session")]
    pub bids_id: BidsIndex,
    #[serde(rename = "oxygen_file")]
    pub source_archive: String,
    pub scans: BTreeMap<ScanKey, Scan>,
}

// Report fields are declared in lexical order of their serialized names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    #[serde(rename = "bids_fpath")]
    bids_path: String,
    #[serde(rename = "conversion_status")]
    converted: bool,
    pub meta: ScanMeta,
    /// `<archive dir>/<session>/<scan>`, relative to the oxygen directory.
    pub series_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMeta {
    pub description: String,
    pub modality: String,
    #[serde(rename = "run")]
    pub run_index: BidsIndex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_meta: Option<BTreeMap<String, String>>,
    #[serde(rename = "type")]
    pub acquisition_type: String,
}

impl ScanMeta {
    /// Functional BOLD defaults applied to every discovered scan.
    pub fn functional(run_index: BidsIndex) -> Self {
        Self {
            acquisition_type: "func".to_string(),
            modality: "bold".to_string(),
            description: "task-fmri".to_string(),
            run_index,
            scanner_meta: None,
        }
    }
}

impl Scan {
    pub fn new(series_dir: impl Into<String>, meta: ScanMeta) -> Self {
        Self {
            series_dir: series_dir.into(),
            bids_path: String::new(),
            converted: false,
            meta,
        }
    }

    pub fn bids_path(&self) -> Option<&str> {
        (!self.bids_path.is_empty()).then_some(self.bids_path.as_str())
    }

    pub fn is_converted(&self) -> bool {
        self.converted
    }

    pub fn mark_converted(&mut self, bids_path: &Utf8PathBuf) {
        self.bids_path = bids_path.to_string();
        self.converted = !self.bids_path.is_empty();
    }

    pub fn reset(&mut self) {
        self.bids_path.clear();
        self.converted = false;
    }
}

/// One conversion unit derived from the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub identity: ScanIdentity,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    /// File stem shared by the image and its sidecar.
    pub output_name: String,
    /// Image path relative to the BIDS root.
    pub relative_path: Utf8PathBuf,
}

impl WorkItem {
    pub fn image_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.nii.gz", self.output_name))
    }
}

impl Mapping {
    pub fn scan_count(&self) -> usize {
        self.scans().count()
    }

    pub fn converted_count(&self) -> usize {
        self.scans().filter(|(_, scan)| scan.is_converted()).count()
    }

    pub fn scans(&self) -> impl Iterator<Item = (ScanIdentity, &Scan)> {
        self.subjects.iter().flat_map(|(subject_key, subject)| {
            subject.sessions.iter().flat_map(move |(session_key, session)| {
                session.scans.iter().map(move |(scan_key, scan)| {
                    (
                        ScanIdentity {
                            subject: subject_key.clone(),
                            session: session_key.clone(),
                            scan: scan_key.clone(),
                        },
                        scan,
                    )
                })
            })
        })
    }

    pub fn scan_mut(&mut self, identity: &ScanIdentity) -> Option<&mut Scan> {
        self.subjects
            .get_mut(&identity.subject)?
            .sessions
            .get_mut(&identity.session)?
            .scans
            .get_mut(&identity.scan)
    }

    /// Flattens the mapping into conversion work items.
    pub fn work_items(&self, oxygen_dir: &Path, bids_dir: &Path) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for (subject_key, subject) in &self.subjects {
            let bids_subject = format!("sub-{}", subject.bids_id);
            for (session_key, session) in &subject.sessions {
                let bids_session = format!("ses-{}", session.bids_id);
                for (scan_key, scan) in &session.scans {
                    let meta = &scan.meta;
                    let mut name = format!(
                        "{bids_subject}_{bids_session}_{}_run-{}",
                        meta.description, meta.run_index
                    );
                    if !meta.modality.is_empty() {
                        name.push('_');
                        name.push_str(&meta.modality);
                    }
                    let relative_dir = Utf8PathBuf::from(&bids_subject)
                        .join(&bids_session)
                        .join(&meta.acquisition_type);
                    items.push(WorkItem {
                        identity: ScanIdentity {
                            subject: subject_key.clone(),
                            session: session_key.clone(),
                            scan: scan_key.clone(),
                        },
                        source_dir: oxygen_dir.join(&scan.series_dir),
                        output_dir: bids_dir.join(relative_dir.as_std_path()),
                        relative_path: relative_dir.join(format!("{name}.nii.gz")),
                        output_name: name,
                    });
                }
            }
        }
        items
    }

    /// Folds per-item conversion results back in. `None` leaves the scan unconverted.
    pub fn apply_results(
        &mut self,
        results: Vec<(ScanIdentity, Option<Utf8PathBuf>)>,
    ) -> Result<(), BidsError> {
        for (identity, converted) in results {
            let scan = self
                .scan_mut(&identity)
                .ok_or_else(|| BidsError::InvalidIdentity(identity.to_string()))?;
            match converted {
                Some(path) => scan.mark_converted(&path),
                None => scan.reset(),
            }
        }
        Ok(())
    }

    pub fn reset_conversions(&mut self) {
        for subject in self.subjects.values_mut() {
            for session in subject.sessions.values_mut() {
                for scan in session.scans.values_mut() {
                    scan.reset();
                }
            }
        }
    }

    /// Loads a mapping written by an earlier run and clears its conversion state.
    pub fn load_guide(path: &Path) -> Result<Self, BidsError> {
        let content = fs::read_to_string(path)
            .map_err(|_| BidsError::MappingGuideRead(path.to_path_buf()))?;
        Self::parse_guide(&content)
    }

    pub fn parse_guide(content: &str) -> Result<Self, BidsError> {
        let mut mapping: Mapping = serde_json::from_str(content)
            .map_err(|err| BidsError::MappingGuideParse(err.to_string()))?;
        for (identity, scan) in mapping.scans() {
            let recovered = ScanIdentity::from_series_dir(&scan.series_dir)
                .map_err(|err| BidsError::MappingGuideParse(err.to_string()))?;
            if recovered != identity {
                return Err(BidsError::MappingGuideParse(format!(
                    "series_dir {} does not belong to {identity}",
                    scan.series_dir
                )));
            }
        }
        mapping.reset_conversions();
        Ok(mapping)
    }

    /// Pretty JSON with subjects ordered by BIDS id and everything below by raw key.
    pub fn to_report_json(&self) -> Result<String, BidsError> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        ReportView(self)
            .serialize(&mut serializer)
            .map_err(|err| BidsError::Report(err.to_string()))?;
        String::from_utf8(buffer).map_err(|err| BidsError::Report(err.to_string()))
    }
}

struct ReportView<'a>(&'a Mapping);

impl Serialize for ReportView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut subjects = self.0.subjects.iter().collect::<Vec<_>>();
        subjects.sort_by(|(ka, a), (kb, b)| a.bids_id.cmp(&b.bids_id).then_with(|| ka.cmp(kb)));
        let mut map = serializer.serialize_map(Some(subjects.len()))?;
        for (key, subject) in subjects {
            map.serialize_entry(key, subject)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapperOptions<'a> {
    pub filters: Option<&'a FilterSpec>,
    pub scanner_meta: bool,
    pub order: ListingOrder,
}

/// Walks extracted oxygen directories and numbers subjects, sessions and scans.
pub struct IdentifierMapper<'a> {
    inspector: &'a dyn SeriesInspector,
    log: &'a SharedLog,
    options: MapperOptions<'a>,
}

impl<'a> IdentifierMapper<'a> {
    pub fn new(
        inspector: &'a dyn SeriesInspector,
        log: &'a SharedLog,
        options: MapperOptions<'a>,
    ) -> Self {
        Self {
            inspector,
            log,
            options,
        }
    }

    pub fn build(&self, oxygen_dir: &Path) -> Result<Mapping, BidsError> {
        let mut mapping = Mapping::default();
        let mut subject_seq = Sequence::new();
        let mut session_seqs: BTreeMap<SubjectKey, Sequence> = BTreeMap::new();

        for archive_dir in fs_util::list_dirs(oxygen_dir, self.options.order)? {
            let archive_name = fs_util::file_name(&archive_dir);
            let subject_key = match archive_name.rsplit('-').next() {
                Some(token) if !token.is_empty() => SubjectKey::from(token),
                _ => {
                    self.log.warning(format!(
                        "Cannot recover a subject id from {}. Skipping...",
                        archive_dir.display()
                    ));
                    continue;
                }
            };

            let subject = mapping
                .subjects
                .entry(subject_key.clone())
                .or_insert_with(|| Subject {
                    bids_id: subject_seq.advance(),
                    sessions: BTreeMap::new(),
                });
            let session_seq = session_seqs.entry(subject_key.clone()).or_default();

            for session_dir in fs_util::list_dirs(&archive_dir, self.options.order)? {
                let session_name = fs_util::file_name(&session_dir);
                let session_key = SessionKey::from(session_name.as_str());
                let Entry::Vacant(slot) = subject.sessions.entry(session_key) else {
                    self.log.warning(format!(
                        "Session {session_name} of subject {subject_key} appears twice; keeping the first. Skipping {}...",
                        session_dir.display()
                    ));
                    continue;
                };
                let session = slot.insert(Session {
                    bids_id: session_seq.advance(),
                    source_archive: format!("{archive_name}-{session_name}-DICOM.tgz"),
                    scans: BTreeMap::new(),
                });
                session.scans = self.map_scans(&archive_name, &session_name, &session_dir)?;
            }
        }

        Ok(mapping)
    }

    fn map_scans(
        &self,
        archive_name: &str,
        session_name: &str,
        session_dir: &Path,
    ) -> Result<BTreeMap<ScanKey, Scan>, BidsError> {
        let mut scans = BTreeMap::new();
        let mut run_seq = Sequence::new();
        let scan_dirs = fs_util::list_children(session_dir, self.options.order, |path| {
            path.is_dir() && fs_util::file_name(path).contains(SCAN_MARKER)
        })?;

        for scan_dir in scan_dirs {
            let decision =
                series::filter_series(&scan_dir, self.options.filters, self.inspector, self.log);
            if !decision.is_kept() {
                continue;
            }
            let scan_name = fs_util::file_name(&scan_dir);
            let mut meta = ScanMeta::functional(run_seq.advance());
            if self.options.scanner_meta {
                meta.scanner_meta = Some(series::scanner_meta(&scan_dir, self.log));
            }
            scans.insert(
                ScanKey::from(scan_name.as_str()),
                Scan::new(format!("{archive_name}/{session_name}/{scan_name}"), meta),
            );
        }

        Ok(scans)
    }
}

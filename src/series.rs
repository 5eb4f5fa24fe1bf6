//! Per-scan metadata: the DICOM sequence filter and `README-Series.txt`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use dicom_object::{Tag, open_file};
use regex::Regex;

use crate::config::FilterSpec;
use crate::fs_util::{self, ListingOrder};
use crate::logger::SharedLog;

pub const README_SERIES: &str = "README-Series.txt";

/// Sequence Name (0018,0024).
const SEQUENCE_NAME: Tag = Tag(0x0018, 0x0024);

const PRIVATE_KEYS: [&str; 4] = ["accession", "physician", "patient", "allerg"];

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W").expect("valid regex"));

/// Reads the acquisition fields the filter needs from one DICOM file.
pub trait SeriesInspector: Send + Sync {
    fn sequence_name(&self, dicom_file: &Path) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DicomInspector;

impl SeriesInspector for DicomInspector {
    fn sequence_name(&self, dicom_file: &Path) -> Option<String> {
        let obj = open_file(dicom_file).ok()?;
        obj.element(SEQUENCE_NAME)
            .ok()
            .and_then(|elem| elem.to_str().ok())
            .map(|value| value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesDecision {
    Keep,
    Skip(String),
}

impl SeriesDecision {
    pub fn is_kept(&self) -> bool {
        matches!(self, SeriesDecision::Keep)
    }
}

pub fn dicom_files(scan_dir: &Path) -> Vec<PathBuf> {
    fs_util::list_children(scan_dir, ListingOrder::Sorted, |path| {
        path.is_file() && fs_util::file_name(path).contains(".dcm")
    })
    .unwrap_or_default()
}

/// Decides whether a scan directory survives `filters`.
///
/// Without filters, or with an empty filter object, every scan is kept. With filters, a directory without DICOM
/// files, without a sequence tag, or with a sequence outside the allow-list is
/// skipped; each skip is logged.
pub fn filter_series(
    scan_dir: &Path,
    filters: Option<&FilterSpec>,
    inspector: &dyn SeriesInspector,
    log: &SharedLog,
) -> SeriesDecision {
    let Some(filters) = filters.filter(|spec| !spec.is_empty()) else {
        return SeriesDecision::Keep;
    };

    let Some(first_dcm) = dicom_files(scan_dir).into_iter().next() else {
        let reason = format!(
            "No DICOM files found in {} directory. Skipping...",
            scan_dir.display()
        );
        log.info(&reason);
        return SeriesDecision::Skip(reason);
    };

    if filters.sequences.is_some() {
        let sequence = inspector
            .sequence_name(&first_dcm)
            .map(|name| name.trim().to_string());
        let matched = sequence
            .as_deref()
            .is_some_and(|name| filters.allows_sequence(name));
        if !matched {
            let reason = format!(
                "The series {} does not contain a sequence within the allowed list of sequences ({}). Skipping...",
                scan_dir.display(),
                sequence.as_deref().unwrap_or("no sequence name")
            );
            log.info(&reason);
            return SeriesDecision::Skip(reason);
        }
    }

    SeriesDecision::Keep
}

/// Turns a README key into a field name: non-word characters become `_` and a
/// leading digit gets a `_` prefix.
pub fn sanitize_key(key: &str) -> String {
    let cleaned = NON_WORD.replace_all(key.trim(), "_").into_owned();
    if cleaned.starts_with(|ch: char| ch.is_ascii_digit()) {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

fn is_private(key: &str) -> bool {
    let lowered = key.to_lowercase();
    PRIVATE_KEYS.iter().any(|private| lowered.contains(private))
}

pub fn parse_readme(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| !key.trim().is_empty() && !is_private(key))
        .map(|(key, value)| (sanitize_key(key), value.trim().to_string()))
        .collect()
}

/// Scanner metadata from the scan's `README-Series.txt`; empty when absent.
pub fn scanner_meta(scan_dir: &Path, log: &SharedLog) -> BTreeMap<String, String> {
    let readme = scan_dir.join(README_SERIES);
    match fs::read_to_string(&readme) {
        Ok(content) => parse_readme(&content),
        Err(err) => {
            log.warning(format!(
                "Could not read scanner metadata from {}: {err}",
                readme.display()
            ));
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryWriter;

    /// Treats the DICOM file's text content as its sequence name.
    struct ContentInspector;

    impl SeriesInspector for ContentInspector {
        fn sequence_name(&self, dicom_file: &Path) -> Option<String> {
            let text = fs::read_to_string(dicom_file).ok()?;
            (!text.is_empty()).then_some(text)
        }
    }

    fn quiet_log() -> SharedLog {
        SharedLog::from_writer(Box::new(MemoryWriter::new()))
    }

    #[test]
    fn trailing_space_in_sequence_still_matches() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("0001.dcm"), "ep2d_bold ").unwrap();
        let filters = FilterSpec::sequences(&["ep2d_bold"]);

        let decision = filter_series(temp.path(), Some(&filters), &ContentInspector, &quiet_log());

        assert_eq!(decision, SeriesDecision::Keep);
    }

    #[test]
    fn other_sequence_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("0001.dcm"), "t1_mprage").unwrap();
        let filters = FilterSpec::sequences(&["ep2d_bold"]);

        let decision = filter_series(temp.path(), Some(&filters), &ContentInspector, &quiet_log());

        assert!(!decision.is_kept());
    }

    #[test]
    fn missing_tag_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("0001.dcm"), "").unwrap();
        let filters = FilterSpec::sequences(&["ep2d_bold"]);

        let decision = filter_series(temp.path(), Some(&filters), &ContentInspector, &quiet_log());

        assert!(!decision.is_kept());
    }

    #[test]
    fn directory_without_dicom_is_skipped_and_logged() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join(README_SERIES), "Series: 1").unwrap();
        let writer = MemoryWriter::new();
        let log = SharedLog::from_writer(Box::new(writer.clone()));
        let filters = FilterSpec::sequences(&["ep2d_bold"]);

        let decision = filter_series(temp.path(), Some(&filters), &ContentInspector, &log);

        assert!(!decision.is_kept());
        assert!(writer.contents().contains("No DICOM files found"));
    }

    fn write_dicom(path: &Path, sequence: &str) {
        use dicom_core::{DataElement, VR, dicom_value};
        use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            SEQUENCE_NAME,
            VR::SH,
            dicom_value!(Str, sequence),
        )]);
        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax("1.2.840.10008.1.2.1")
                    .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.4")
                    .media_storage_sop_instance_uid("2.25.1"),
            )
            .unwrap();
        file.write_to_file(path).unwrap();
    }

    #[test]
    fn dicom_sequence_tag_drives_the_filter() {
        let temp = tempfile::tempdir().unwrap();
        let bold = temp.path().join("mr_0001");
        let anat = temp.path().join("mr_0002");
        fs::create_dir_all(&bold).unwrap();
        fs::create_dir_all(&anat).unwrap();
        write_dicom(&bold.join("i0001.dcm"), "ep2d_bold ");
        write_dicom(&anat.join("i0001.dcm"), "t1_mprage");
        let filters = FilterSpec::sequences(&["ep2d_bold"]);
        let log = quiet_log();

        assert_eq!(
            DicomInspector
                .sequence_name(&bold.join("i0001.dcm"))
                .map(|name| name.trim().to_string()),
            Some("ep2d_bold".to_string())
        );
        assert_eq!(
            filter_series(&bold, Some(&filters), &DicomInspector, &log),
            SeriesDecision::Keep
        );
        assert!(!filter_series(&anat, Some(&filters), &DicomInspector, &log).is_kept());
    }

    #[test]
    fn no_filters_keeps_everything() {
        let temp = tempfile::tempdir().unwrap();
        let decision = filter_series(temp.path(), None, &ContentInspector, &quiet_log());
        assert_eq!(decision, SeriesDecision::Keep);
    }

    #[test]
    fn empty_filter_keeps_directory_without_dicom() {
        let temp = tempfile::tempdir().unwrap();
        let decision = filter_series(
            temp.path(),
            Some(&FilterSpec::default()),
            &ContentInspector,
            &quiet_log(),
        );
        assert_eq!(decision, SeriesDecision::Keep);
    }

    #[test]
    fn readme_drops_private_keys_and_sanitizes() {
        let content = "Series Description: ep2d_bold 1.5mm\n\
                       Patient Name: DOE^JANE\n\
                       Accession Number: 12345\n\
                       Referring Physician: Dr X\n\
                       Allergies: none\n\
                       3D Flag: yes\n\
                       Echo Time (ms): 22\n\
                       no colon here\n";

        let meta = parse_readme(content);

        assert_eq!(meta.len(), 3);
        assert_eq!(meta["Series_Description"], "ep2d_bold 1.5mm");
        assert_eq!(meta["_3D_Flag"], "yes");
        assert_eq!(meta["Echo_Time__ms_"], "22");
    }

    #[test]
    fn value_keeps_colons_after_the_first() {
        let meta = parse_readme("Acquisition Time: 10:42:01\n");
        assert_eq!(meta["Acquisition_Time"], "10:42:01");
    }
}

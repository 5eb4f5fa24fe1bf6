use std::path::{Path, PathBuf};

use crate::command::CommandRunner;
use crate::config::ConversionSettings;
use crate::convert::Converter;
use crate::error::BidsError;
use crate::executor::Executor;
use crate::fs_util::{self, ListingOrder};
use crate::logger::SharedLog;
use crate::mapping::{IdentifierMapper, Mapping, MapperOptions};
use crate::series::SeriesInspector;

#[derive(Debug, Clone, Default)]
pub struct ExtractionSummary {
    pub extracted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Drives a full oxygen → BIDS conversion run.
pub struct BidsConversion<'a> {
    runner: &'a dyn CommandRunner,
    inspector: &'a dyn SeriesInspector,
    log: &'a SharedLog,
}

impl<'a> BidsConversion<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        inspector: &'a dyn SeriesInspector,
        log: &'a SharedLog,
    ) -> Self {
        Self {
            runner,
            inspector,
            log,
        }
    }

    pub fn run(&self, settings: &ConversionSettings) -> Result<Mapping, BidsError> {
        let mut mapping = match &settings.mapping_guide {
            Some(guide) => Mapping::load_guide(guide)?,
            None => Mapping::default(),
        };
        let executor = Executor::new(settings.workers)?;
        // Only touch the BIDS tree once every configuration input checked out.
        prepare_bids_dir(&settings.bids_dir, settings.overwrite)?;
        tracing::info!("converting with {}", executor.workers());

        self.log.info("Extracting compressed files...");
        let extraction = self.extract_archives(&settings.oxygen_dir, settings.order, &executor)?;
        self.log.info(format!(
            "Compressed file extractions complete. {} extracted, {} failed.",
            extraction.extracted.len(),
            extraction.failed.len()
        ));

        if settings.mapping_guide.is_none() {
            let mapper = IdentifierMapper::new(
                self.inspector,
                self.log,
                MapperOptions {
                    filters: settings.filters.as_ref(),
                    scanner_meta: settings.scanner_meta,
                    order: settings.order,
                },
            );
            mapping = mapper.build(&settings.oxygen_dir)?;
        }
        tracing::info!(
            subjects = mapping.subjects.len(),
            scans = mapping.scan_count(),
            "mapping ready"
        );

        let items = mapping.work_items(&settings.oxygen_dir, &settings.bids_dir);
        let converter = Converter::new(settings.tool, self.runner, self.log);
        let results = executor.run_keyed(
            items,
            |item| item.identity.clone(),
            |item| converter.convert(&item),
        )?;
        mapping.apply_results(results)?;

        self.log.info(format!(
            "Converted {} of {} scans.",
            mapping.converted_count(),
            mapping.scan_count()
        ));
        Ok(mapping)
    }

    /// Extracts every regular file in `oxygen_dir` in place. Bad archives are
    /// logged and skipped.
    pub fn extract_archives(
        &self,
        oxygen_dir: &Path,
        order: ListingOrder,
        executor: &Executor,
    ) -> Result<ExtractionSummary, BidsError> {
        let archives = fs_util::list_files(oxygen_dir, order)?;
        let results = executor.run_keyed(
            archives,
            |archive| archive.clone(),
            |archive| fs_util::extract_tgz(&archive, oxygen_dir),
        )?;

        let mut summary = ExtractionSummary::default();
        for (archive, result) in results {
            match result {
                Ok(extracted) => {
                    self.log.info(format!(
                        "Extracted file {} to {} directory.",
                        archive.display(),
                        extracted.display()
                    ));
                    summary.extracted.push(extracted);
                }
                Err(err) => {
                    self.log.error(format!("Could not extract {}: {err}", archive.display()));
                    summary.failed.push(archive);
                }
            }
        }
        Ok(summary)
    }
}

/// Creates the BIDS directory, or empties it when `overwrite` allows.
/// Existing content without `overwrite` aborts the run before any work.
pub fn prepare_bids_dir(bids_dir: &Path, overwrite: bool) -> Result<(), BidsError> {
    if !bids_dir.is_dir() {
        return fs_util::create_path(bids_dir);
    }
    if fs_util::is_empty_dir(bids_dir)? {
        return Ok(());
    }
    if !overwrite {
        return Err(BidsError::DuplicateContent(bids_dir.to_path_buf()));
    }
    fs_util::clear_dir(bids_dir)
}

/// Writes `bids_mapping_<timestamp>.json` into `mapping_dir`.
pub fn write_mapping_report(
    mapping: &Mapping,
    mapping_dir: &Path,
    timestamp: &str,
) -> Result<PathBuf, BidsError> {
    let path = mapping_dir.join(format!("bids_mapping_{timestamp}.json"));
    let content = mapping.to_report_json()?;
    fs_util::write_bytes_atomic(&path, content.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn missing_bids_dir_is_created() {
        let temp = tempfile::tempdir().unwrap();
        let bids = temp.path().join("bids");
        prepare_bids_dir(&bids, false).unwrap();
        assert!(bids.is_dir());
    }

    #[test]
    fn non_empty_without_overwrite_fails() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("dataset_description.json"), b"{}").unwrap();

        let err = prepare_bids_dir(temp.path(), false).unwrap_err();

        assert_matches!(err, BidsError::DuplicateContent(_));
        assert!(err.is_preflight());
        assert!(temp.path().join("dataset_description.json").exists());
    }

    #[test]
    fn overwrite_empties_directory() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("sub-0001/ses-0001/func")).unwrap();

        prepare_bids_dir(temp.path(), true).unwrap();

        assert!(fs_util::is_empty_dir(temp.path()).unwrap());
    }
}

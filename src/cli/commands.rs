//! Command implementations for the segpatch CLI.

use std::path::Path;

use log::{debug, info};

use crate::cli::args::*;
use crate::cli::output::*;
use crate::error::{Result, SegpatchError};
use crate::lexical::config::PatchCompression;
use crate::lexical::patch::merger::PatchMerger;
use crate::lexical::patch::reader::PatchFileReader;
use crate::storage::file::FileStorage;
use crate::storage::StorageConfig;

/// Execute a CLI command.
pub fn execute_command(args: SegpatchArgs) -> Result<()> {
    match &args.command {
        Command::Inspect(inspect_args) => inspect_patch(inspect_args, &args),
        Command::Merge(merge_args) => merge_patches(merge_args, &args),
    }
}

/// Print one patch file.
fn inspect_patch(args: &InspectArgs, cli_args: &SegpatchArgs) -> Result<()> {
    let reader = open_patch_file(&args.file, cli_args.compression())?;
    let meta = reader.meta();
    let mut report = PatchFileReport {
        file: args.file.display().to_string(),
        src_segment: reader.source_segment(),
        dst_segment: reader.destination_segment(),
        non_null_term_count: meta.non_null_term_count,
        has_null_term: meta.has_null_term,
        item_count: reader.total_item_count(),
        terms: Vec::new(),
        truncated: false,
    };

    if !args.meta_only {
        let terms = reader.read_all()?;
        report.truncated = args.limit.is_some_and(|limit| terms.len() > limit);
        report.terms = terms
            .iter()
            .take(args.limit.unwrap_or(usize::MAX))
            .map(|(term, deltas)| TermEntry::new(*term, deltas))
            .collect();
    }

    output_result("Patch file inspected", &report, cli_args)
}

/// Print the merged view of several patch files.
fn merge_patches(args: &MergeArgs, cli_args: &SegpatchArgs) -> Result<()> {
    let readers = args
        .files
        .iter()
        .map(|path| open_patch_file(path, cli_args.compression()))
        .collect::<Result<Vec<_>>>()?;

    let merger = PatchMerger::new(readers)?;
    let dst_segment = merger.destination_segment();
    info!(
        "merging {} patch files ({} events)",
        merger.reader_count(),
        merger.total_item_count()
    );

    let terms = merger.read_all()?;
    let item_count = terms.iter().map(|(_, deltas)| deltas.len() as u64).sum();
    let report = MergeReport {
        dst_segment,
        sources: args.files.iter().map(|p| p.display().to_string()).collect(),
        term_count: terms.len(),
        item_count,
        truncated: args.limit.is_some_and(|limit| terms.len() > limit),
        terms: terms
            .iter()
            .take(args.limit.unwrap_or(usize::MAX))
            .map(|(term, deltas)| TermEntry::new(*term, deltas))
            .collect(),
    };

    output_result("Patch files merged", &report, cli_args)
}

/// Open a patch file given by a filesystem path.
pub fn open_patch_file(path: &Path, compression: PatchCompression) -> Result<PatchFileReader> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            SegpatchError::invalid_argument(format!("{} is not a file path", path.display()))
        })?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !path.is_file() {
        return Err(SegpatchError::storage(format!(
            "{} does not exist",
            path.display()
        )));
    }

    debug!("opening {file_name} in {}", directory.display());
    let storage = FileStorage::new(directory, StorageConfig::default())?;
    PatchFileReader::open(&storage, file_name, compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexical::core::term_key::TermKey;
    use crate::lexical::patch::buffer::SegmentUpdateBuffer;
    use tempfile::TempDir;

    fn write_patch(dir: &Path, src: u32, dst: u32) {
        let storage = FileStorage::new(dir, StorageConfig::default()).unwrap();
        let buffer = SegmentUpdateBuffer::new("tag", src, dst, PatchCompression::None);
        buffer.try_update(1, TermKey::new(7), src % 2 == 0).unwrap();
        buffer.try_update(2, TermKey::NULL, false).unwrap();
        let info = buffer.dump(&storage).unwrap().into_info().unwrap();

        // Move the dumped file to the directory root.
        std::fs::rename(dir.join(info.path()), dir.join(&info.file_name)).unwrap();
    }

    #[test]
    fn test_open_patch_file() {
        let dir = TempDir::new().unwrap();
        write_patch(dir.path(), 3, 0);

        let reader =
            open_patch_file(&dir.path().join("3_0.patch"), PatchCompression::None).unwrap();
        assert_eq!(reader.source_segment(), 3);
        assert_eq!(reader.destination_segment(), 0);
        assert_eq!(reader.total_item_count(), 2);

        assert!(open_patch_file(&dir.path().join("4_0.patch"), PatchCompression::None).is_err());
    }

    #[test]
    fn test_execute_inspect_and_merge() {
        let dir = TempDir::new().unwrap();
        write_patch(dir.path(), 3, 0);
        write_patch(dir.path(), 4, 0);

        let first = dir.path().join("3_0.patch");
        let second = dir.path().join("4_0.patch");
        let inspect = SegpatchArgs {
            verbose: 0,
            quiet: true,
            output_format: OutputFormat::Json,
            pretty: false,
            lz4: false,
            lz4_block_size: 0,
            command: Command::Inspect(InspectArgs {
                file: first.clone(),
                meta_only: false,
                limit: Some(1),
            }),
        };
        execute_command(inspect.clone()).unwrap();

        let merge = SegpatchArgs {
            command: Command::Merge(MergeArgs {
                files: vec![first, second],
                limit: None,
            }),
            ..inspect
        };
        execute_command(merge).unwrap();
    }
}

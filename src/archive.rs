use anyhow::{anyhow, Context, Result};
use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::types::ArchiveSummary;

const COMPRESSION_LEVEL: i32 = 9;

/// Packs a capture directory into a single zip.
pub struct ArchiveAssembler;

impl ArchiveAssembler {
    /// Zips every regular file under `dir` into `archive`, relative paths
    /// preserved. If `archive` lives inside `dir` it is left out of itself.
    /// Returns only once the archive is flushed, synced and readable again.
    pub fn assemble(dir: &Path, archive: &Path) -> Result<ArchiveSummary> {
        let mut files = vec![];
        collect_files(dir, dir, &mut files)
            .context(format!("could not list files in {:?}", dir))?;
        files.sort();

        let zip_file =
            File::create(archive).context(format!("could not create archive {:?}", archive))?;
        let skip = archive.canonicalize().ok();

        let mut zip = ZipWriter::new(zip_file);
        let mut entries = 0;
        for rel in &files {
            let full = dir.join(rel);
            if skip.is_some() && full.canonicalize().ok() == skip {
                continue;
            }
            let name = entry_name(rel)?;
            let size = fs::metadata(&full)?.len();
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(COMPRESSION_LEVEL))
                .large_file(size >= u32::MAX as u64);
            zip.start_file(name.as_str(), options)
                .context(format!("could not add {} to archive", name))?;
            let mut src = File::open(&full).context(format!("could not open {:?}", full))?;
            io::copy(&mut src, &mut zip).context(format!("could not compress {:?}", full))?;
            entries += 1;
        }

        let mut zip_file = zip.finish().context("could not finalize archive")?;
        zip_file.flush()?;
        zip_file.sync_all().context("could not sync archive to disk")?;
        drop(zip_file);

        let check = ZipArchive::new(File::open(archive)?).context("archive is unreadable")?;
        if check.len() != entries {
            return Err(anyhow!(
                "archive has {} entries, expected {}",
                check.len(),
                entries
            ));
        }

        let size = fs::metadata(archive)?.len();
        debug!("archive {:?} written: {} entries, {} bytes", archive, entries, size);
        Ok(ArchiveSummary {
            path: archive.to_path_buf(),
            entries,
            size,
        })
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

// zip entries always use '/' whatever the platform
fn entry_name(rel: &Path) -> Result<String> {
    let parts = rel
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| anyhow!("non utf-8 path {:?}", rel))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

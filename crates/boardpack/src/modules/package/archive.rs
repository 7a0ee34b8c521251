use std::fs::File;
use std::io::{self, BufReader, Seek, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{Error, Result};
use crate::modules::util::{self, EntryKind};

const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
}

impl ArchiveStats {
    pub fn entries(&self) -> usize {
        self.dirs + self.files + self.symlinks
    }
}

fn zip_err(what: &str, e: zip::result::ZipError) -> Error {
    Error::Io(format!("{what}: {e}"))
}

fn options(mode: u32) -> SimpleFileOptions {
    // DateTime::default() is 1980-01-01 00:00:00, the zip epoch.
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(mode)
}

/// Write `tree` into `out` as a zip whose bytes depend only on the tree's
/// paths, contents and executable bits. Every entry lives under `top/`.
pub fn write_tree_zip<W: Write + Seek>(tree: &Path, top: &str, out: W) -> Result<ArchiveStats> {
    let top = top.trim_matches('/');
    if top.is_empty() || top.contains('/') {
        return Err(Error::msg(format!("invalid archive top-level dir '{top}'")));
    }

    let mut zw = ZipWriter::new(out);
    let mut stats = ArchiveStats::default();
    zw.add_directory(format!("{top}/"), options(DIR_MODE))
        .map_err(|e| zip_err("failed to add top-level dir", e))?;
    stats.dirs += 1;

    // list_tree already yields byte-wise sorted, `/`-separated paths.
    for e in util::list_tree(tree)? {
        let name = format!("{top}/{}", e.rel);
        match &e.kind {
            EntryKind::Dir => {
                zw.add_directory(format!("{name}/"), options(DIR_MODE))
                    .map_err(|err| zip_err(&format!("failed to add {name}"), err))?;
                stats.dirs += 1;
            }
            EntryKind::File { executable } => {
                let mode = if *executable { EXEC_MODE } else { FILE_MODE };
                zw.start_file(name.as_str(), options(mode))
                    .map_err(|err| zip_err(&format!("failed to add {name}"), err))?;
                let f = File::open(&e.path)
                    .map_err(|err| Error::io(format!("failed to open {}", e.path.display()), err))?;
                io::copy(&mut BufReader::new(f), &mut zw)
                    .map_err(|err| Error::io(format!("failed to archive {}", e.path.display()), err))?;
                stats.files += 1;
            }
            EntryKind::Symlink { target } => {
                zw.add_symlink(name.as_str(), target.as_str(), options(DIR_MODE))
                    .map_err(|err| zip_err(&format!("failed to add symlink {name}"), err))?;
                stats.symlinks += 1;
            }
        }
    }

    zw.finish()
        .map_err(|e| zip_err("failed to finish archive", e))?;
    Ok(stats)
}

/// Build the archive next to `dest` and move it into place only once it is
/// complete.
pub fn write_tree_zip_file(tree: &Path, top: &str, dest: &Path) -> Result<ArchiveStats> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::msg(format!("{} has no parent dir", dest.display())))?;
    util::ensure_dir(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".boardpack-")
        .suffix(".zip.tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io(format!("failed to create temp file in {}", dir.display()), e))?;
    let stats = write_tree_zip(tree, top, tmp.as_file_mut())?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io("failed to sync archive", e))?;
    tmp.persist(dest)
        .map_err(|e| Error::io(format!("failed to move archive to {}", dest.display()), e.error))?;
    Ok(stats)
}

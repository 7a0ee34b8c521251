use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::modules::util;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Extract `archive` below `scratch` and return the archive's single
/// top-level directory (vendor releases ship `esp32-<version>/...`).
pub fn extract_single_root(archive: &Path, scratch: &Path) -> Result<PathBuf> {
    if scratch.exists() {
        fs::remove_dir_all(scratch)
            .map_err(|e| Error::io(format!("failed to clear {}", scratch.display()), e))?;
    }
    util::ensure_dir(scratch)?;

    let file = File::open(archive)
        .map_err(|e| Error::io(format!("failed to open {}", archive.display()), e))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| Error::Archive(format!("{} is not a readable zip: {e}", archive.display())))?;

    let mut tops = BTreeSet::<String>::new();
    let mut top_has_file = false;
    let mut dir_modes = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::Archive(format!("{}: entry #{i}: {e}", archive.display())))?;
        let name = entry.name().to_string();
        let Some(rel) = entry
            .enclosed_name()
            .filter(|p| !p.components().any(|c| c == Component::ParentDir))
        else {
            return Err(Error::Archive(format!(
                "{}: entry '{name}' escapes the extraction root",
                archive.display()
            )));
        };
        let mut comps = rel.components().filter(|c| matches!(c, Component::Normal(_)));
        let Some(top) = comps.next() else {
            continue;
        };
        tops.insert(top.as_os_str().to_string_lossy().into_owned());
        if comps.next().is_none() && !entry.is_dir() {
            top_has_file = true;
        }

        reject_symlinked_path(scratch, &rel).map_err(|link| {
            Error::Archive(format!(
                "{}: entry '{name}' would be written through symlink {}",
                archive.display(),
                link.display()
            ))
        })?;
        let out = scratch.join(&rel);
        let mode = entry.unix_mode();
        if entry.is_dir() {
            util::ensure_dir(&out)?;
            if let Some(m) = mode {
                dir_modes.push((out, m & 0o777));
            }
        } else if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            entry.read_to_string(&mut target).map_err(|e| {
                Error::Archive(format!("{}: symlink '{name}': {e}", archive.display()))
            })?;
            if !link_stays_inside(&rel, &target) {
                return Err(Error::Archive(format!(
                    "{}: symlink '{name}' -> '{target}' points outside the extraction root",
                    archive.display()
                )));
            }
            make_symlink(&target, &out)?;
        } else {
            copy_entry(&mut entry, &out, &name, archive)?;
            if let Some(m) = mode {
                set_mode(&out, m & 0o777)?;
            }
        }
    }

    // Directory modes go on last, deepest first, so a read-only directory
    // never blocks writing its children.
    dir_modes.sort_by(|a, b| b.0.cmp(&a.0));
    for (dir, m) in &dir_modes {
        set_mode(dir, *m)?;
    }

    if top_has_file || tops.len() != 1 {
        return Err(Error::Archive(format!(
            "{}: expected a single top-level directory, found [{}]",
            archive.display(),
            tops.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    let root = tops
        .into_iter()
        .next()
        .map(|t| scratch.join(t))
        .ok_or_else(|| Error::Archive(format!("{} is empty", archive.display())))?;
    util::pin_mtime(&root)?;
    Ok(root)
}

// Returns the first existing symlink on the way from `scratch` to `rel`.
fn reject_symlinked_path(scratch: &Path, rel: &Path) -> std::result::Result<(), PathBuf> {
    let mut cur = scratch.to_path_buf();
    for c in rel.components() {
        cur.push(c);
        if cur.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
            return Err(cur);
        }
    }
    Ok(())
}

/// Whether a link at `rel` pointing at `target` resolves below the
/// extraction root.
fn link_stays_inside(rel: &Path, target: &str) -> bool {
    let target = Path::new(target);
    if target.as_os_str().is_empty() || target.has_root() {
        return false;
    }
    let mut depth = rel.parent().map_or(0, |p| {
        p.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    });
    for c in target.components() {
        match c {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                let Some(d) = depth.checked_sub(1) else {
                    return false;
                };
                depth = d;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn copy_entry<R: Read>(entry: &mut R, out: &Path, name: &str, archive: &Path) -> Result<()> {
    if let Some(parent) = out.parent() {
        util::ensure_dir(parent)?;
    }
    let file = File::create(out)
        .map_err(|e| Error::io(format!("failed to create {}", out.display()), e))?;
    let mut w = BufWriter::new(file);
    let mut buf = vec![0u8; 1024 * 64];
    loop {
        // Read failures mean a corrupt entry; write failures are local disk.
        let n = entry
            .read(&mut buf)
            .map_err(|e| Error::Archive(format!("{}: entry '{name}': {e}", archive.display())))?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n])
            .map_err(|e| Error::io(format!("failed to write {}", out.display()), e))?;
    }
    w.flush()
        .map_err(|e| Error::io(format!("failed to flush {}", out.display()), e))
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        util::ensure_dir(parent)?;
    }
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| Error::io(format!("failed to create symlink {}", link.display()), e))
}

#[cfg(not(unix))]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    util::write_bytes(link, target.as_bytes())
}

#[cfg(unix)]
fn set_mode(p: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(p, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(format!("failed to set mode on {}", p.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_p: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

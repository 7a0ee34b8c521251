use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// Timestamp pinned on extracted/overlaid files and on every archive entry:
/// 1980-01-01T00:00:00Z, the earliest time a zip entry can carry.
pub const SOURCE_EPOCH_SECS: i64 = 315_532_800;

pub fn module_dir(doc: &ConfigDoc, ctx: &ExecCtx, module_id: &str) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let mut out = ws.build_dir;
    for seg in module_id.split('.').filter(|s| !s.is_empty()) {
        out = out.join(seg);
    }
    Ok(out)
}

pub fn validate_rel_like_path(p: &str) -> Result<()> {
    let path = p.trim();
    if path.is_empty() {
        return Err(Error::msg("path is empty"));
    }
    let pb = Path::new(path);
    if pb.is_absolute() {
        return Err(Error::msg(format!("path '{path}' must be relative")));
    }
    if pb
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(Error::msg(format!("path '{path}' contains '..'")));
    }
    Ok(())
}

/// Expand `{name}` placeholders; `{{` and `}}` stand for literal braces.
/// Any placeholder left unresolved is an error so a typo never ends up in a
/// published URL or file name. Braces around anything that is not a
/// placeholder name are kept as they are.
pub fn expand_template(raw: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(i) = rest.find(['{', '}']) {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('{')
            && let Some(end) = tail.find('}')
        {
            let name = &tail[1..end];
            if is_placeholder_name(name) {
                let Some((_, value)) = vars.iter().find(|(k, _)| *k == name) else {
                    return Err(Error::msg(format!(
                        "unknown placeholder '{{{name}}}' in '{raw}' (write '{{{{' for a literal brace)"
                    )));
                };
                out.push_str(value);
                rest = &tail[end + 1..];
                continue;
            }
        }
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p).map_err(|e| Error::io(format!("failed to create dir {}", p.display()), e))
}

pub fn write_bytes(p: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, data).map_err(|e| Error::io(format!("failed to write {}", p.display()), e))
}

pub fn write_json_pretty<T: Serialize>(p: &Path, v: &T) -> Result<()> {
    let mut s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error for {}: {e}", p.display())))?;
    s.push('\n');
    write_bytes(p, s.as_bytes())
}

pub fn read_json<T: DeserializeOwned>(p: &Path) -> Result<Option<T>> {
    if !p.is_file() {
        return Ok(None);
    }
    let data = fs::read_to_string(p)
        .map_err(|e| Error::io(format!("failed to read {}", p.display()), e))?;
    let parsed = serde_json::from_str(&data)
        .map_err(|e| Error::msg(format!("failed to decode {}: {e}", p.display())))?;
    Ok(Some(parsed))
}

pub fn remove_file_if_exists(p: &Path) -> Result<()> {
    match fs::remove_file(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("failed to remove {}", p.display()), e)),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File { executable: bool },
    Symlink { target: String },
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// `/`-separated path relative to the listed root.
    pub rel: String,
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Every entry under `root` (the root itself excluded), sorted byte-wise by
/// relative path. Symlinks are listed, never followed.
pub fn list_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(root)
            .map_err(|e| Error::Io(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel_s = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let ft = entry.file_type();
        let kind = if ft.is_symlink() {
            let target = fs::read_link(p)
                .map_err(|e| Error::io(format!("failed to read symlink {}", p.display()), e))?;
            EntryKind::Symlink {
                target: target.to_string_lossy().replace('\\', "/"),
            }
        } else if ft.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File {
                executable: is_executable(p)?,
            }
        };
        out.push(TreeEntry {
            rel: rel_s,
            path: p.to_path_buf(),
            kind,
        });
    }
    out.sort_by(|a, b| a.rel.as_bytes().cmp(b.rel.as_bytes()));
    Ok(out)
}

#[cfg(unix)]
fn is_executable(p: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let meta =
        fs::metadata(p).map_err(|e| Error::io(format!("failed to stat {}", p.display()), e))?;
    Ok(meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_p: &Path) -> Result<bool> {
    Ok(false)
}

/// Content digest of a directory tree: paths, entry kinds, the executable
/// bit and file contents. Timestamps and ownership are ignored.
pub fn tree_digest(root: &Path) -> Result<String> {
    if !root.is_dir() {
        return Err(Error::Io(format!("{} is not a directory", root.display())));
    }
    let mut hasher = Sha256::new();
    for e in list_tree(root)? {
        let line = match &e.kind {
            EntryKind::Dir => format!("d {}\n", e.rel),
            EntryKind::File { executable } => format!(
                "f {} {} {}\n",
                e.rel,
                if *executable { "x" } else { "-" },
                sha256_file_hex(&e.path)?
            ),
            EntryKind::Symlink { target } => format!("l {} {target}\n", e.rel),
        };
        hasher.update(line.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of a single overlay target: file hash for files, tree digest for
/// directories.
pub fn path_digest(p: &Path) -> Result<String> {
    if p.is_dir() {
        tree_digest(p)
    } else {
        sha256_file_hex(p)
    }
}

/// Pin the modification time of `p` (and everything below it) to the
/// source epoch.
pub fn pin_mtime(p: &Path) -> Result<()> {
    let t = filetime::FileTime::from_unix_time(SOURCE_EPOCH_SECS, 0);
    let pin = |path: &Path| {
        filetime::set_file_mtime(path, t)
            .map_err(|e| Error::io(format!("failed to set mtime on {}", path.display()), e))
    };
    if p.is_dir() {
        for e in list_tree(p)? {
            if !matches!(e.kind, EntryKind::Symlink { .. }) {
                pin(&e.path)?;
            }
        }
    }
    if !p.is_symlink() {
        pin(p)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion_rejects_unknown_placeholders() {
        let out = expand_template(
            "{package}-v{version}.zip",
            &[("package", "bpad_proto1"), ("version", "0.1.0")],
        )
        .expect("expand");
        assert_eq!(out, "bpad_proto1-v0.1.0.zip");

        let err = expand_template("{package}-{sha}.zip", &[("package", "p")])
            .unwrap_err()
            .to_string();
        assert!(err.contains("{sha}"), "unexpected err: {err}");

        let err = expand_template(
            "{package}-v{version}-{git_sah}.zip",
            &[("package", "p"), ("version", "1.0.0")],
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("{git_sah}"), "unexpected err: {err}");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let out = expand_template(
            "recipe.hooks.prebuild.1.pattern={{runtime.platform.path}}/{board.name}.sh",
            &[("board.name", "bpad_proto1")],
        )
        .expect("expand");
        assert_eq!(
            out,
            "recipe.hooks.prebuild.1.pattern={runtime.platform.path}/bpad_proto1.sh"
        );
        // Values are inserted verbatim, never expanded again.
        assert_eq!(
            expand_template("{a} { b }", &[("a", "{b}")]).expect("expand"),
            "{b} { b }"
        );
    }

    #[test]
    fn tree_digest_ignores_mtime_but_not_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("tree");
        write_bytes(&root.join("variants/bpad/pins_arduino.h"), b"#define LED 2\n").unwrap();
        write_bytes(&root.join("boards.txt"), b"bpad.name=bpad\n").unwrap();

        let before = tree_digest(&root).expect("digest");
        pin_mtime(&root).expect("pin mtime");
        assert_eq!(tree_digest(&root).expect("digest"), before);

        write_bytes(&root.join("boards.txt"), b"bpad.name=other\n").unwrap();
        assert_ne!(tree_digest(&root).expect("digest"), before);
    }

    #[test]
    fn list_tree_is_sorted_with_forward_slashes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write_bytes(&root.join("b/z.txt"), b"z").unwrap();
        write_bytes(&root.join("a.txt"), b"a").unwrap();
        write_bytes(&root.join("B.txt"), b"B").unwrap();

        let rels: Vec<String> = list_tree(root).unwrap().into_iter().map(|e| e.rel).collect();
        assert_eq!(rels, ["B.txt", "a.txt", "b", "b/z.txt"]);
    }

    #[test]
    fn rejects_escaping_relative_paths() {
        assert!(validate_rel_like_path("variants/bpad_proto1").is_ok());
        assert!(validate_rel_like_path("../boards.txt").is_err());
        assert!(validate_rel_like_path("/etc/passwd").is_err());
        assert!(validate_rel_like_path("  ").is_err());
    }
}

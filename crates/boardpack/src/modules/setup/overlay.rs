use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util::{self, EntryKind};
use crate::workspace::WorkspacePaths;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayMode {
    /// The destination must already exist upstream.
    #[default]
    Replace,
    /// The destination must not need any new parent directories.
    Create,
}

impl OverlayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OverlayMode::Replace => "replace",
            OverlayMode::Create => "create",
        }
    }
}

/// One `[[overlay.files]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayFile {
    pub dst: String,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub mode: OverlayMode,
    /// SHA-256 of the upstream file at `dst` before it is overwritten.
    #[serde(default)]
    pub expect_sha256: Option<String>,
    #[serde(default)]
    pub executable: bool,
}

/// One `[[overlay.patches]]` entry: a literal edit of an upstream text file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayPatch {
    pub path: String,
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub expect_sha256: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    pub files: Vec<OverlayFile>,
    pub patches: Vec<OverlayPatch>,
}

enum Source {
    Inline(Vec<u8>),
    Path(PathBuf),
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<()> {
        for (i, f) in self.files.iter().enumerate() {
            util::validate_rel_like_path(&f.dst)
                .map_err(|e| e.context(format!("overlay.files[{i}].dst")))?;
            if f.src.is_some() == f.content.is_some() {
                return Err(Error::msg(format!(
                    "overlay.files[{i}] ({}) needs exactly one of 'src' or 'content'",
                    f.dst
                )));
            }
        }
        for (i, p) in self.patches.iter().enumerate() {
            util::validate_rel_like_path(&p.path)
                .map_err(|e| e.context(format!("overlay.patches[{i}].path")))?;
            if p.find.is_empty() {
                return Err(Error::msg(format!(
                    "overlay.patches[{i}] ({}) has an empty 'find'",
                    p.path
                )));
            }
        }
        Ok(())
    }
}

/// Apply every overlay file, then every patch, to `tree`. Returns the
/// content digest each touched path has in the finished tree, keyed by its
/// tree-relative path.
pub fn apply(
    ctx: &ExecCtx,
    ws: &WorkspacePaths,
    tree: &Path,
    cfg: &OverlayConfig,
    vars: &[(&str, &str)],
) -> Result<std::collections::BTreeMap<String, String>> {
    cfg.validate()?;
    let mut applied = std::collections::BTreeMap::new();

    for f in &cfg.files {
        let src = match (&f.content, &f.src) {
            (Some(text), _) => Source::Inline(text.as_bytes().to_vec()),
            (None, Some(src)) => Source::Path(ws.resolve_config_path(src)?),
            (None, None) => continue,
        };
        let dst = tree.join(f.dst.trim());
        check_target(f, &dst)?;
        let want = place(&src, &dst, f.executable)?;
        let got = util::path_digest(&dst)?;
        if got != want {
            return Err(Error::Io(format!(
                "overlay {} was written but reads back with a different digest",
                f.dst
            )));
        }
        ctx.log(&format!("overlay {} ({})", f.dst, f.mode.as_str()));
        applied.insert(rel_key(&f.dst), got);
    }

    for p in &cfg.patches {
        let target = tree.join(p.path.trim());
        if !target.is_file() {
            return Err(Error::LayoutMismatch(format!(
                "patch target {} does not exist in the upstream tree",
                p.path
            )));
        }
        check_expected_hash(&p.path, &target, p.expect_sha256.as_deref())?;
        let find = util::expand_template(&p.find, vars)?;
        let replace = util::expand_template(&p.replace, vars)?;
        let text = fs::read_to_string(&target)
            .map_err(|e| Error::io(format!("failed to read {}", target.display()), e))?;
        if !text.contains(&find) {
            if p.required {
                return Err(Error::LayoutMismatch(format!(
                    "patch anchor '{find}' not found in {}",
                    p.path
                )));
            }
            ctx.log(&format!("patch {}: '{find}' not present, skipped", p.path));
            continue;
        }
        util::write_bytes(&target, text.replace(&find, &replace).as_bytes())?;
        ctx.log(&format!("patched {}: '{find}' -> '{replace}'", p.path));
        applied.insert(rel_key(&p.path), String::new());
    }

    // Later files and patches may land inside an earlier directory overlay.
    for (rel, digest) in applied.iter_mut() {
        *digest = util::path_digest(&tree.join(rel))?;
    }
    // Writing files bumps their parent directories too.
    util::pin_mtime(tree)?;
    Ok(applied)
}

fn rel_key(p: &str) -> String {
    p.trim().trim_end_matches('/').replace('\\', "/")
}

fn check_target(f: &OverlayFile, dst: &Path) -> Result<()> {
    match f.mode {
        OverlayMode::Replace => {
            if !dst.exists() {
                return Err(Error::LayoutMismatch(format!(
                    "overlay target {} does not exist in the upstream tree (mode = replace)",
                    f.dst
                )));
            }
        }
        OverlayMode::Create => {
            let parent_ok = dst.parent().is_some_and(Path::is_dir);
            if !parent_ok {
                return Err(Error::LayoutMismatch(format!(
                    "parent directory of overlay target {} does not exist in the upstream tree",
                    f.dst
                )));
            }
        }
    }
    check_expected_hash(&f.dst, dst, f.expect_sha256.as_deref())
}

fn check_expected_hash(name: &str, path: &Path, expected: Option<&str>) -> Result<()> {
    let Some(want) = expected else {
        return Ok(());
    };
    if !path.exists() {
        return Err(Error::LayoutMismatch(format!(
            "{name} was expected upstream with sha256 {want} but is missing"
        )));
    }
    let got = util::path_digest(path)?;
    if !want.trim().eq_ignore_ascii_case(&got) {
        return Err(Error::LayoutMismatch(format!(
            "upstream {name} has sha256 {got}, expected {want}"
        )));
    }
    Ok(())
}

// Returns the digest the destination must have afterwards.
fn place(src: &Source, dst: &Path, executable: bool) -> Result<String> {
    if dst.is_dir() {
        fs::remove_dir_all(dst)
            .map_err(|e| Error::io(format!("failed to remove {}", dst.display()), e))?;
    }
    match src {
        Source::Inline(bytes) => {
            util::write_bytes(dst, bytes)?;
            set_executable(dst, executable)?;
            Ok(util::sha256_hex(bytes))
        }
        Source::Path(p) if p.is_dir() => {
            util::remove_file_if_exists(dst)?;
            copy_tree(p, dst)?;
            util::tree_digest(p)
        }
        Source::Path(p) if p.is_file() => {
            fs::copy(p, dst).map_err(|e| {
                Error::io(
                    format!("failed to copy {} -> {}", p.display(), dst.display()),
                    e,
                )
            })?;
            if executable {
                set_executable(dst, true)?;
            }
            util::sha256_file_hex(p)
        }
        Source::Path(p) => Err(Error::msg(format!(
            "overlay source {} does not exist",
            p.display()
        ))),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    util::ensure_dir(dst)?;
    for e in util::list_tree(src)? {
        let out = dst.join(&e.rel);
        match &e.kind {
            EntryKind::Dir => util::ensure_dir(&out)?,
            EntryKind::File { .. } => {
                fs::copy(&e.path, &out).map_err(|err| {
                    Error::io(
                        format!("failed to copy {} -> {}", e.path.display(), out.display()),
                        err,
                    )
                })?;
            }
            EntryKind::Symlink { target } => copy_symlink(target, &out)?,
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| Error::io(format!("failed to create symlink {}", link.display()), e))
}

#[cfg(not(unix))]
fn copy_symlink(target: &str, link: &Path) -> Result<()> {
    Err(Error::msg(format!(
        "cannot copy symlink {} -> {target} on this platform",
        link.display()
    )))
}

#[cfg(unix)]
fn set_executable(p: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(p, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(format!("failed to set mode on {}", p.display()), e))
}

#[cfg(not(unix))]
fn set_executable(_p: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

//! Build stage: check the sealed working tree, archive it deterministically
//! and publish the manifest fields for the board-manager index.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use boardpack_macros::{Module, Task};
use serde::{Deserialize, Serialize};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::setup::fetch::format_mb;
use crate::modules::setup::{BoardConfig, UpstreamConfig, record};
use crate::modules::util;

pub mod archive;
pub mod index;

use index::{IndexTarget, ManifestEntry};

const ARTIFACT_FILE: &str = "artifact.json";

fn default_true() -> bool {
    true
}

fn default_archive_name() -> String {
    "{package}-v{version}-{git_sha}.zip".into()
}

fn default_category() -> String {
    "ESP32".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Local copy of the board-manager index JSON.
    pub path: String,
    #[serde(default = "default_true")]
    pub update: bool,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub platform_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    pub version: String,
    /// Placeholders: `{package}`, `{version}`, `{git_sha}`.
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
    /// Download URL of the published archive. Placeholders: `{package}`,
    /// `{version}`, `{archive}`.
    #[serde(default)]
    pub url: Option<String>,
    /// Compare the whole tree against the digest recorded at seal time.
    #[serde(default = "default_true")]
    pub verify_tree: bool,
    #[serde(default)]
    pub index: Option<IndexConfig>,
}

impl PackageConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc
            .deserialize_path("package")?
            .ok_or_else(|| Error::msg(format!("{}: missing [package]", doc.path.display())))?;
        let name = cfg.name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(Error::msg(format!(
                "package.name '{name}' is invalid (allowed: a-zA-Z0-9_.-)"
            )));
        }
        semver::Version::parse(cfg.version.trim()).map_err(|e| {
            Error::msg(format!(
                "package.version '{}' is not a semantic version: {e}",
                cfg.version
            ))
        })?;
        Ok(cfg)
    }

    /// `git_sha` is only called when the template mentions `{git_sha}`.
    pub fn archive_file_name(&self, git_sha: impl FnOnce() -> String) -> Result<String> {
        let mut vars = vec![
            ("package", self.name.trim().to_string()),
            ("version", self.version.trim().to_string()),
        ];
        if self.archive_name.contains("{git_sha}") {
            vars.push(("git_sha", git_sha()));
        }
        let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let name = util::expand_template(self.archive_name.trim(), &vars)?;
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::msg(format!(
                "package.archive_name expands to an invalid file name '{name}'"
            )));
        }
        Ok(name)
    }

    pub fn release_url(&self, archive: &str) -> Result<Option<String>> {
        let Some(url) = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        util::expand_template(
            url,
            &[
                ("package", self.name.trim()),
                ("version", self.version.trim()),
                ("archive", archive),
            ],
        )
        .map(Some)
    }
}

/// What `package.archive` produced, for `package.manifest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub file_name: String,
    pub entries: usize,
}

fn package_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let dir = util::module_dir(doc, ctx, "package")?;
    util::ensure_dir(&dir)?;
    Ok(dir)
}

fn git_short_sha(ctx: &ExecCtx, root: &std::path::Path) -> String {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(root).args(["rev-parse", "--short", "HEAD"]);
    match ctx.capture_cmd(cmd) {
        Ok(sha) if !sha.is_empty() => sha,
        Ok(_) => "unknown".into(),
        Err(e) => {
            tracing::debug!(error = %e, "git sha unavailable");
            ctx.log("git sha unavailable, using 'unknown'");
            "unknown".into()
        }
    }
}

#[Task(
    id = "package.verify",
    module = "package",
    phase = "verify",
    provides = ["package:verified"],
    after = ["core:initialized", "setup:sealed?"],
    default_label = "Verify working tree",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for VerifyTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl VerifyTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let pkg = PackageConfig::load(doc)?;
        let board = BoardConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let setup_dir = util::module_dir(doc, ctx, "setup")?;
        let tree = board.tree_path(&ws)?;

        let Some(rec) = record::load_setup_record(&setup_dir)? else {
            return Err(Error::Precondition(format!(
                "setup has not completed ({} missing); run `boardpack setup` first",
                setup_dir.join(record::STATE_FILE).display()
            )));
        };
        if !tree.is_dir() {
            return Err(Error::Precondition(format!(
                "working tree {} not found; run `boardpack setup` first",
                tree.display()
            )));
        }
        if rec.tree_dir != tree {
            return Err(Error::Precondition(format!(
                "setup was run for {}, but board.tree_dir points at {}",
                rec.tree_dir.display(),
                tree.display()
            )));
        }
        if doc.has_table_path("upstream") {
            let up = UpstreamConfig::load(doc)?;
            if up.version.trim() != rec.upstream_version {
                return Err(Error::Precondition(format!(
                    "working tree was set up from upstream {}, but {} is configured; run `boardpack setup` again",
                    rec.upstream_version,
                    up.version.trim()
                )));
            }
        }

        let missing = board.missing_required(&tree);
        if !missing.is_empty() {
            return Err(Error::Precondition(format!(
                "working tree {} lacks {}",
                tree.display(),
                missing.join(", ")
            )));
        }

        for (rel, want) in &rec.overlays {
            let p = tree.join(rel);
            if !p.exists() {
                return Err(Error::Precondition(format!(
                    "overlay path {rel} is missing from the working tree"
                )));
            }
            if &util::path_digest(&p)? != want {
                return Err(Error::Precondition(format!(
                    "overlay path {rel} changed since setup"
                )));
            }
        }

        if pkg.verify_tree {
            let digest = util::tree_digest(&tree)?;
            if digest != rec.tree_digest {
                return Err(Error::Precondition(format!(
                    "working tree {} changed since setup was sealed at {}",
                    tree.display(),
                    rec.sealed_at.to_rfc3339()
                )));
            }
        }

        ctx.log(&format!(
            "working tree {} matches setup of upstream {} ({} overlay path(s))",
            tree.display(),
            rec.upstream_version,
            rec.overlays.len()
        ));
        Ok(())
    }
}

#[Task(
    id = "package.archive",
    module = "package",
    phase = "archive",
    provides = ["package:archive"],
    after = ["package:verified"],
    default_label = "Create release archive",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ArchiveTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ArchiveTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let pkg = PackageConfig::load(doc)?;
        let board = BoardConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = package_dir(doc, ctx)?;
        util::remove_file_if_exists(&dir.join(ARTIFACT_FILE))?;
        let tree = board.tree_path(&ws)?;

        let name = pkg.archive_file_name(|| git_short_sha(ctx, &ws.root))?;
        util::ensure_dir(&ws.out_dir)?;
        log_existing_releases(ctx, &ws.out_dir)?;

        let dest = ws.out_dir.join(&name);
        if dest.exists() {
            ctx.log(&format!("replacing {}", dest.display()));
        }
        let top = tree
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::msg(format!("working tree {} has no name", tree.display())))?;
        ctx.log(&format!("creating {}", dest.display()));
        let stats = archive::write_tree_zip_file(&tree, &top, &dest)?;
        ctx.log(&format!(
            "archived {} files, {} dirs, {} symlinks under {top}/",
            stats.files, stats.dirs, stats.symlinks
        ));

        util::write_json_pretty(
            &dir.join(ARTIFACT_FILE),
            &ArtifactRecord {
                path: dest,
                file_name: name,
                entries: stats.entries(),
            },
        )
    }
}

fn log_existing_releases(ctx: &ExecCtx, out_dir: &std::path::Path) -> Result<()> {
    let mut found = Vec::new();
    let rd = fs::read_dir(out_dir)
        .map_err(|e| Error::io(format!("failed to list {}", out_dir.display()), e))?;
    for entry in rd {
        let entry = entry.map_err(|e| Error::io(format!("failed to list {}", out_dir.display()), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".zip") {
            continue;
        }
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        found.push((name, len));
    }
    found.sort();
    ctx.log(&format!("existing releases in {}:", out_dir.display()));
    if found.is_empty() {
        ctx.log("  (none)");
    }
    for (name, len) in found {
        ctx.log(&format!("  {name} ({})", format_mb(len)));
    }
    Ok(())
}

#[Task(
    id = "package.manifest",
    module = "package",
    phase = "manifest",
    provides = ["package:manifest"],
    after = ["package:archive"],
    default_label = "Emit manifest entry",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ManifestTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ManifestTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let pkg = PackageConfig::load(doc)?;
        let board = BoardConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = package_dir(doc, ctx)?;
        let art: ArtifactRecord = util::read_json(&dir.join(ARTIFACT_FILE))?.ok_or_else(|| {
            Error::Precondition("no release archive recorded; run package.archive first".into())
        })?;
        if !art.path.is_file() {
            return Err(Error::Precondition(format!(
                "release archive {} is missing",
                art.path.display()
            )));
        }

        let sha256 = util::sha256_file_hex(&art.path)?;
        let size = fs::metadata(&art.path)
            .map_err(|e| Error::io(format!("failed to stat {}", art.path.display()), e))?
            .len();
        let url = pkg.release_url(&art.file_name)?;
        let entry = ManifestEntry::new(
            pkg.version.trim(),
            url.as_deref()
                .unwrap_or(&format!("<release-url>/{}", art.file_name)),
            &art.file_name,
            &sha256,
            size,
        );

        let manifest_path = ws.out_dir.join(format!("{}.json", art.file_name));
        util::write_json_pretty(&manifest_path, &entry)?;

        ctx.log(&format!("file:     {}", art.file_name));
        ctx.log(&format!("size:     {size} bytes ({})", format_mb(size)));
        ctx.log(&format!("checksum: SHA-256:{sha256}"));
        ctx.log(&format!("manifest: {}", manifest_path.display()));
        for line in entry.display_lines() {
            ctx.log(&format!("  {line}"));
        }

        match pkg.index.as_ref().filter(|i| i.update) {
            Some(idx) => {
                if url.is_none() {
                    return Err(Error::msg(
                        "package.index.update needs package.url to know where the archive is published",
                    ));
                }
                let path = ws.resolve_config_path(&idx.path)?;
                let platform_name = idx
                    .platform_name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| {
                        if board.name.trim().is_empty() {
                            pkg.name.trim().to_string()
                        } else {
                            board.name.trim().to_string()
                        }
                    });
                let change = index::update_index_file(
                    &path,
                    &IndexTarget {
                        package: pkg.name.trim(),
                        architecture: board.architecture.trim(),
                        platform_name: &platform_name,
                        category: idx.category.trim(),
                    },
                    &entry,
                )?;
                ctx.log(&format!("index {}: {change}", path.display()));
            }
            None => ctx.log("update your board-manager index with the fields above"),
        }

        let tag = format!("v{}", pkg.version.trim());
        ctx.log("next steps:");
        ctx.log(&format!("  1. tag this commit: git tag {tag}"));
        ctx.log("  2. push tags: git push --tags");
        ctx.log(&format!("  3. create a release for {tag}"));
        ctx.log(&format!("  4. upload {} to the release", art.file_name));
        Ok(())
    }
}

#[Module(
    id = "package",
    stage = "package",
    detect = "package",
    tasks = [VerifyTask, ArchiveTask, ManifestTask]
)]
pub struct PackageModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(src: &str) -> ConfigDoc {
        ConfigDoc::from_value("/w/boardpack.toml", toml::from_str(src).expect("toml"))
    }

    #[test]
    fn archive_name_only_asks_for_git_sha_when_needed() {
        let d = doc(r#"
            [package]
            name = "bpad_proto1"
            version = "0.1.0"
        "#);
        let pkg = PackageConfig::load(&d).unwrap();
        assert_eq!(
            pkg.archive_file_name(|| "abc1234".into()).unwrap(),
            "bpad_proto1-v0.1.0-abc1234.zip"
        );

        let d = doc(r#"
            [package]
            name = "bpad_proto1"
            version = "0.1.0"
            archive_name = "{package}-{version}.zip"
        "#);
        let pkg = PackageConfig::load(&d).unwrap();
        let name = pkg
            .archive_file_name(|| panic!("git sha requested"))
            .unwrap();
        assert_eq!(name, "bpad_proto1-0.1.0.zip");
    }

    #[test]
    fn version_must_be_semver() {
        let d = doc(r#"
            [package]
            name = "bpad_proto1"
            version = "0.1"
        "#);
        assert!(matches!(PackageConfig::load(&d), Err(Error::Config(_))));
    }

    #[test]
    fn release_url_expands_archive_name() {
        let d = doc(r#"
            [package]
            name = "bpad_proto1"
            version = "0.1.0"
            url = "https://github.com/bpad/bpad_proto1_core/releases/download/v{version}/{archive}"

            [package.steps.archive]
            label = "Zip it"
        "#);
        let pkg = PackageConfig::load(&d).unwrap();
        assert_eq!(
            pkg.release_url("bpad_proto1-v0.1.0-abc1234.zip").unwrap().as_deref(),
            Some(
                "https://github.com/bpad/bpad_proto1_core/releases/download/v0.1.0/bpad_proto1-v0.1.0-abc1234.zip"
            )
        );
    }
}

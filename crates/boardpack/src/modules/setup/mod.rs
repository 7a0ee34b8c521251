//! Setup stage: fetch the pinned upstream core release, extract it into the
//! working tree, overlay the board files and seal the result.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use boardpack_macros::{Module, Task};
use chrono::Utc;
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::package::PackageConfig;
use crate::modules::util;
use crate::workspace::WorkspacePaths;

pub mod extract;
pub mod fetch;
pub mod overlay;
pub mod record;

use overlay::OverlayConfig;
use record::{FETCH_FILE, FetchRecord, OVERLAY_FILE, OverlayRecord, STATE_FILE, SetupRecord};

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub version: String,
    /// May contain `{version}`.
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Defaults to the last segment of the URL.
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc
            .deserialize_path("upstream")?
            .ok_or_else(|| Error::msg(format!("{}: missing [upstream]", doc.path.display())))?;
        if cfg.version.trim().is_empty() {
            return Err(Error::msg("upstream.version is empty"));
        }
        if cfg.url.trim().is_empty() {
            return Err(Error::msg("upstream.url is empty"));
        }
        if let Some(sha) = cfg.sha256.as_deref()
            && (sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(Error::msg(format!(
                "upstream.sha256 '{sha}' is not a hex SHA-256 digest"
            )));
        }
        Ok(cfg)
    }

    pub fn resolved_url(&self) -> Result<String> {
        util::expand_template(self.url.trim(), &[("version", self.version.trim())])
    }

    pub fn archive_file_name(&self) -> Result<String> {
        let name = match self.file_name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => {
                util::expand_template(n, &[("version", self.version.trim())])?
            }
            _ => {
                let url = self.resolved_url()?;
                let path = url.split(['?', '#']).next().unwrap_or_default();
                path.rsplit('/').next().unwrap_or_default().to_string()
            }
        };
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::msg(format!(
                "cannot derive an archive file name from upstream.url; set upstream.file_name (got '{name}')"
            )));
        }
        Ok(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoardConfig {
    pub name: String,
    pub architecture: String,
    /// Working tree location, relative to the workspace root.
    pub tree_dir: String,
    /// Files whose absence means the tree is not a usable core.
    pub required_files: Vec<String>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            architecture: "esp32".into(),
            tree_dir: "esp32".into(),
            required_files: vec!["platform.txt".into(), "boards.txt".into()],
        }
    }
}

impl BoardConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.deserialize_path("board")?.unwrap_or_default();
        for f in &cfg.required_files {
            util::validate_rel_like_path(f)
                .map_err(|e| e.context("board.required_files"))?;
        }
        Ok(cfg)
    }

    pub fn tree_path(&self, ws: &WorkspacePaths) -> Result<PathBuf> {
        ws.resolve_under_root(&self.tree_dir)
            .map_err(|e| e.context("board.tree_dir"))
    }

    pub fn missing_required(&self, tree: &std::path::Path) -> Vec<String> {
        self.required_files
            .iter()
            .filter(|f| !tree.join(f.trim()).exists())
            .cloned()
            .collect()
    }
}

/// Placeholder values available to overlay patches.
fn patch_vars(doc: &ConfigDoc, up: &UpstreamConfig) -> Result<Vec<(String, String)>> {
    let board = BoardConfig::load(doc)?;
    let mut vars = vec![
        ("upstream.version".to_string(), up.version.trim().to_string()),
        ("board.name".to_string(), board.name.clone()),
        ("board.architecture".to_string(), board.architecture.clone()),
    ];
    if let Some(pkg) = doc.deserialize_path::<PackageConfig>("package")? {
        vars.push(("package.name".into(), pkg.name.clone()));
        vars.push(("package.version".into(), pkg.version.clone()));
    }
    Ok(vars)
}

fn setup_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let dir = util::module_dir(doc, ctx, "setup")?;
    util::ensure_dir(&dir)?;
    Ok(dir)
}

#[Task(
    id = "setup.fetch",
    module = "setup",
    phase = "fetch",
    provides = ["setup:archive"],
    after = ["core:initialized"],
    default_label = "Fetch upstream archive",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Download again even if a cached archive is present.
    pub force: bool,
}

impl Default for FetchTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            force: false,
        }
    }
}

impl FetchTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let up = UpstreamConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = setup_dir(doc, ctx)?;
        record::invalidate(&dir)?;
        util::remove_file_if_exists(&dir.join(FETCH_FILE))?;

        let url = up.resolved_url()?;
        let dest = ws.build_dir.join("downloads").join(up.archive_file_name()?);
        ctx.log(&format!("upstream version {}", up.version.trim()));
        let rec = fetch::fetch_archive(
            ctx,
            &fetch::FetchRequest {
                url: &url,
                dest: &dest,
                expected_sha256: up.sha256.as_deref(),
                timeout: Duration::from_secs(up.timeout_secs.max(1)),
                force: cfg.force,
            },
        )?;
        ctx.log(&format!(
            "archive {} ({}, sha256 {})",
            rec.path.display(),
            fetch::format_mb(rec.size),
            rec.sha256
        ));
        util::write_json_pretty(&dir.join(FETCH_FILE), &rec)
    }
}

#[Task(
    id = "setup.extract",
    module = "setup",
    phase = "extract",
    provides = ["setup:tree"],
    after = ["setup:archive"],
    default_label = "Extract upstream archive",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ExtractTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ExtractTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let board = BoardConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = setup_dir(doc, ctx)?;
        record::invalidate(&dir)?;
        let fetched: FetchRecord = util::read_json(&dir.join(FETCH_FILE))?.ok_or_else(|| {
            Error::Precondition("no fetched archive recorded; run setup.fetch first".into())
        })?;
        let tree = board.tree_path(&ws)?;

        ctx.log(&format!("extracting {}", fetched.path.display()));
        let scratch = dir.join("extract");
        let top = extract::extract_single_root(&fetched.path, &scratch)?;
        ctx.log(&format!(
            "archive top-level: {}",
            top.file_name().unwrap_or_default().to_string_lossy()
        ));

        ws.remove_dir(&tree)?;
        if let Some(parent) = tree.parent() {
            util::ensure_dir(parent)?;
        }
        fs::rename(&top, &tree).map_err(|e| {
            Error::io(
                format!("failed to move {} -> {}", top.display(), tree.display()),
                e,
            )
        })?;
        fs::remove_dir_all(&scratch)
            .map_err(|e| Error::io(format!("failed to remove {}", scratch.display()), e))?;
        ctx.log(&format!("working tree {}", tree.display()));
        Ok(())
    }
}

#[Task(
    id = "setup.overlay",
    module = "setup",
    phase = "overlay",
    provides = ["setup:overlay"],
    after = ["setup:tree"],
    default_label = "Overlay board files",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for OverlayTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl OverlayTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let up = UpstreamConfig::load(doc)?;
        let board = BoardConfig::load(doc)?;
        let overlay_cfg: OverlayConfig = doc.deserialize_path("overlay")?.unwrap_or_default();
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = setup_dir(doc, ctx)?;
        let tree = board.tree_path(&ws)?;
        if !tree.is_dir() {
            return Err(Error::Precondition(format!(
                "working tree {} does not exist; run setup.extract first",
                tree.display()
            )));
        }

        let vars = patch_vars(doc, &up)?;
        let vars: Vec<(&str, &str)> = vars
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let applied = overlay::apply(ctx, &ws, &tree, &overlay_cfg, &vars)?;
        ctx.log(&format!("{} overlay path(s) applied", applied.len()));
        util::write_json_pretty(&dir.join(OVERLAY_FILE), &OverlayRecord { applied })
    }
}

#[Task(
    id = "setup.seal",
    module = "setup",
    phase = "seal",
    provides = ["setup:sealed"],
    after = ["setup:overlay"],
    default_label = "Seal working tree",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SealTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for SealTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl SealTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let up = UpstreamConfig::load(doc)?;
        let board = BoardConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = setup_dir(doc, ctx)?;
        let tree = board.tree_path(&ws)?;

        let missing = board.missing_required(&tree);
        if !missing.is_empty() {
            return Err(Error::LayoutMismatch(format!(
                "working tree {} lacks {}",
                tree.display(),
                missing.join(", ")
            )));
        }
        let fetched: FetchRecord = util::read_json(&dir.join(FETCH_FILE))?
            .ok_or_else(|| Error::Precondition("no fetched archive recorded".into()))?;
        let overlays: OverlayRecord = util::read_json(&dir.join(OVERLAY_FILE))?
            .ok_or_else(|| Error::Precondition("overlay step did not complete".into()))?;

        let tree_digest = util::tree_digest(&tree)?;
        let rec = SetupRecord {
            upstream_version: up.version.trim().to_string(),
            upstream_url: fetched.url,
            archive_sha256: fetched.sha256,
            tree_dir: tree.clone(),
            overlays: overlays.applied,
            tree_digest,
            sealed_at: Utc::now(),
        };
        util::write_json_pretty(&dir.join(STATE_FILE), &rec)?;
        ctx.log(&format!("sealed {} (digest {})", tree.display(), rec.tree_digest));

        if let Some(pkg) = doc.deserialize_path::<PackageConfig>("package")? {
            ctx.log(&format!(
                "to try it locally, copy {} to Arduino15/packages/{}/hardware/{}/{}/",
                tree.display(),
                pkg.name,
                board.architecture,
                pkg.version
            ));
        }
        ctx.log("run `boardpack build` to create a release archive");
        Ok(())
    }
}

#[Module(
    id = "setup",
    stage = "setup",
    detect = "upstream",
    tasks = [FetchTask, ExtractTask, OverlayTask, SealTask]
)]
pub struct SetupModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(src: &str) -> ConfigDoc {
        ConfigDoc::from_value("/w/boardpack.toml", toml::from_str(src).expect("toml"))
    }

    #[test]
    fn upstream_url_and_file_name_follow_version() {
        let d = doc(r#"
            [upstream]
            version = "2.0.17"
            url = "https://github.com/espressif/arduino-esp32/releases/download/{version}/esp32-{version}.zip"
        "#);
        let up = UpstreamConfig::load(&d).unwrap();
        assert_eq!(
            up.resolved_url().unwrap(),
            "https://github.com/espressif/arduino-esp32/releases/download/2.0.17/esp32-2.0.17.zip"
        );
        assert_eq!(up.archive_file_name().unwrap(), "esp32-2.0.17.zip");
        assert_eq!(up.timeout_secs, 600);
    }

    #[test]
    fn upstream_rejects_bad_pins() {
        let d = doc(r#"
            [upstream]
            version = "2.0.17"
            url = "https://example.invalid/esp32.zip"
            sha256 = "abc"
        "#);
        assert!(matches!(UpstreamConfig::load(&d), Err(Error::Config(_))));

        let d = doc(r#"
            [upstream]
            version = "2.0.17"
            url = "https://example.invalid/download/"
        "#);
        let up = UpstreamConfig::load(&d).unwrap();
        assert!(up.archive_file_name().is_err());
    }

    #[test]
    fn board_defaults_match_the_esp32_core_layout() {
        let b = BoardConfig::load(&doc("")).unwrap();
        assert_eq!(b.tree_dir, "esp32");
        assert_eq!(b.architecture, "esp32");
        assert_eq!(b.required_files, ["platform.txt", "boards.txt"]);
    }

    #[test]
    fn patch_vars_include_package_fields_when_present() {
        let d = doc(r#"
            [upstream]
            version = "2.0.17"
            url = "https://example.invalid/esp32-{version}.zip"

            [board]
            name = "bpad proto1"

            [package]
            name = "bpad_proto1"
            version = "0.1.0"
        "#);
        let up = UpstreamConfig::load(&d).unwrap();
        let vars = patch_vars(&d, &up).unwrap();
        assert!(vars.contains(&("package.version".into(), "0.1.0".into())));
        assert!(vars.contains(&("board.name".into(), "bpad proto1".into())));
    }
}

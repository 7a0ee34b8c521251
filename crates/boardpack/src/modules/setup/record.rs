use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::modules::util;

pub const FETCH_FILE: &str = "fetch.json";
pub const OVERLAY_FILE: &str = "overlay.json";
pub const STATE_FILE: &str = "state.json";

/// Where the upstream archive came from and what it hashed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRecord {
    pub url: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub downloaded: bool,
}

/// Digest of every overlay target after `setup.overlay`, keyed by the
/// tree-relative path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayRecord {
    pub applied: BTreeMap<String, String>,
}

/// Written last by `setup.seal`. Its presence is what "setup completed" means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRecord {
    pub upstream_version: String,
    pub upstream_url: String,
    pub archive_sha256: String,
    pub tree_dir: PathBuf,
    pub overlays: BTreeMap<String, String>,
    pub tree_digest: String,
    pub sealed_at: DateTime<Utc>,
}

pub fn load_setup_record(setup_dir: &Path) -> Result<Option<SetupRecord>> {
    util::read_json(&setup_dir.join(STATE_FILE))
}

/// Drop the completion marker and intermediate records so an interrupted
/// setup can never be mistaken for a finished one.
pub fn invalidate(setup_dir: &Path) -> Result<()> {
    util::remove_file_if_exists(&setup_dir.join(STATE_FILE))?;
    util::remove_file_if_exists(&setup_dir.join(OVERLAY_FILE))
}

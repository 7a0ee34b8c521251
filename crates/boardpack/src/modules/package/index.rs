//! Board-manager index handling: the manifest entry for one release and
//! merging it into a local copy of the package index JSON.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::modules::util;

/// The fields a board-manager platform entry needs for one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub version: String,
    pub url: String,
    pub archive_file_name: String,
    /// `SHA-256:<hex>`.
    pub checksum: String,
    /// Decimal byte count, as a string.
    pub size: String,
}

impl ManifestEntry {
    pub fn new(version: &str, url: &str, archive_file_name: &str, sha256: &str, size: u64) -> Self {
        Self {
            version: version.to_string(),
            url: url.to_string(),
            archive_file_name: archive_file_name.to_string(),
            checksum: format!("SHA-256:{sha256}"),
            size: size.to_string(),
        }
    }

    fn apply_to(&self, platform: &mut Map<String, Value>) {
        platform.insert("version".into(), json!(self.version));
        platform.insert("url".into(), json!(self.url));
        platform.insert("archiveFileName".into(), json!(self.archive_file_name));
        platform.insert("checksum".into(), json!(self.checksum));
        platform.insert("size".into(), json!(self.size));
    }

    /// One `"key": "value"` line per field, ready to paste into an index.
    pub fn display_lines(&self) -> Vec<String> {
        vec![
            format!("\"version\": \"{}\"", self.version),
            format!("\"url\": \"{}\"", self.url),
            format!("\"archiveFileName\": \"{}\"", self.archive_file_name),
            format!("\"checksum\": \"{}\"", self.checksum),
            format!("\"size\": \"{}\"", self.size),
        ]
    }
}

/// What to merge, and under which package/platform identity.
#[derive(Debug, Clone)]
pub struct IndexTarget<'a> {
    pub package: &'a str,
    pub architecture: &'a str,
    pub platform_name: &'a str,
    pub category: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    /// A platform with the same version and architecture was rewritten.
    Updated,
    /// A new platform was added, copied from an earlier release.
    AppendedFromTemplate,
    /// A new platform was added with only the computed fields.
    Appended,
}

impl fmt::Display for IndexChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexChange::Updated => "updated existing platform",
            IndexChange::AppendedFromTemplate => "appended platform (copied from previous release)",
            IndexChange::Appended => "appended platform",
        })
    }
}

fn invalid(path: &Path, what: impl fmt::Display) -> Error {
    Error::Precondition(format!("index {}: {what}", path.display()))
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// Merge `entry` into the index document in memory.
pub fn merge_entry(
    doc: &mut Value,
    target: &IndexTarget<'_>,
    entry: &ManifestEntry,
    path: &Path,
) -> Result<IndexChange> {
    let packages = doc
        .as_object_mut()
        .ok_or_else(|| invalid(path, "top level is not an object"))?
        .entry("packages")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| invalid(path, "'packages' is not an array"))?;

    let pkg_idx = match packages
        .iter()
        .position(|p| str_field(p, "name") == Some(target.package))
    {
        Some(i) => i,
        None => {
            packages.push(json!({
                "name": target.package,
                "platforms": [],
                "tools": [],
            }));
            packages.len() - 1
        }
    };
    let platforms = packages[pkg_idx]
        .as_object_mut()
        .ok_or_else(|| invalid(path, format!("package '{}' is not an object", target.package)))?
        .entry("platforms")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| invalid(path, "'platforms' is not an array"))?;

    let same_arch = |p: &Value| str_field(p, "architecture") == Some(target.architecture);

    if let Some(existing) = platforms
        .iter_mut()
        .find(|p| same_arch(p) && str_field(p, "version") == Some(entry.version.as_str()))
    {
        let obj = existing
            .as_object_mut()
            .ok_or_else(|| invalid(path, "platform entry is not an object"))?;
        entry.apply_to(obj);
        return Ok(IndexChange::Updated);
    }

    let template = platforms
        .iter()
        .filter(|p| same_arch(p))
        .filter_map(|p| {
            let v = semver::Version::parse(str_field(p, "version")?).ok()?;
            Some((v, p))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .and_then(|(_, p)| p.as_object().cloned());

    let (mut platform, change) = match template {
        Some(t) => (t, IndexChange::AppendedFromTemplate),
        None => {
            let mut m = Map::new();
            m.insert("name".into(), json!(target.platform_name));
            m.insert("architecture".into(), json!(target.architecture));
            m.insert("version".into(), json!(entry.version));
            m.insert("category".into(), json!(target.category));
            m.insert("boards".into(), json!([]));
            m.insert("toolsDependencies".into(), json!([]));
            (m, IndexChange::Appended)
        }
    };
    entry.apply_to(&mut platform);
    platforms.push(Value::Object(platform));
    Ok(change)
}

/// Read the index at `path` (or start an empty one), merge `entry` and write
/// it back atomically.
pub fn update_index_file(
    path: &Path,
    target: &IndexTarget<'_>,
    entry: &ManifestEntry,
) -> Result<IndexChange> {
    let mut doc = if path.is_file() {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        serde_json::from_str(&raw).map_err(|e| invalid(path, format!("invalid JSON: {e}")))?
    } else {
        json!({ "packages": [] })
    };
    let change = merge_entry(&mut doc, target, entry, path)?;

    let mut text = serde_json::to_string_pretty(&doc)
        .map_err(|e| Error::msg(format!("json encode error for {}: {e}", path.display())))?;
    text.push('\n');

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    util::ensure_dir(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to create temp file in {}", dir.display()), e))?;
    tmp.write_all(text.as_bytes())
        .map_err(|e| Error::io(format!("failed to write {}", tmp.path().display()), e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(format!("failed to replace {}", path.display()), e.error))?;
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> IndexTarget<'static> {
        IndexTarget {
            package: "bpad_proto1",
            architecture: "esp32",
            platform_name: "bpad proto1",
            category: "ESP32",
        }
    }

    fn entry(version: &str) -> ManifestEntry {
        ManifestEntry::new(
            version,
            &format!("https://example.invalid/bpad_proto1-v{version}-abc1234.zip"),
            &format!("bpad_proto1-v{version}-abc1234.zip"),
            "00ff",
            1234,
        )
    }

    fn index() -> Value {
        json!({
            "packages": [{
                "name": "bpad_proto1",
                "maintainer": "bpad",
                "platforms": [{
                    "name": "bpad proto1",
                    "architecture": "esp32",
                    "version": "0.1.0",
                    "category": "ESP32",
                    "url": "old",
                    "archiveFileName": "old.zip",
                    "checksum": "SHA-256:old",
                    "size": "1",
                    "help": { "online": "https://example.invalid" },
                    "boards": [{ "name": "bpad proto1" }],
                    "toolsDependencies": [{ "packager": "esp32", "name": "xtensa-esp32-elf-gcc" }]
                }],
                "tools": []
            }]
        })
    }

    #[test]
    fn manifest_fields_use_index_formats() {
        let e = entry("0.1.0");
        assert_eq!(e.checksum, "SHA-256:00ff");
        assert_eq!(e.size, "1234");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["archiveFileName"], "bpad_proto1-v0.1.0-abc1234.zip");
        assert_eq!(e.display_lines()[3], "\"checksum\": \"SHA-256:00ff\"");
    }

    #[test]
    fn same_version_is_updated_in_place() {
        let mut doc = index();
        let change = merge_entry(&mut doc, &target(), &entry("0.1.0"), Path::new("i.json")).unwrap();
        assert_eq!(change, IndexChange::Updated);
        let platforms = doc["packages"][0]["platforms"].as_array().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0]["checksum"], "SHA-256:00ff");
        assert_eq!(platforms[0]["help"]["online"], "https://example.invalid");
    }

    #[test]
    fn new_version_copies_the_latest_platform() {
        let mut doc = index();
        let change = merge_entry(&mut doc, &target(), &entry("0.2.0"), Path::new("i.json")).unwrap();
        assert_eq!(change, IndexChange::AppendedFromTemplate);
        let platforms = doc["packages"][0]["platforms"].as_array().unwrap();
        assert_eq!(platforms.len(), 2);
        assert_eq!(platforms[1]["version"], "0.2.0");
        assert_eq!(platforms[1]["size"], "1234");
        assert_eq!(platforms[1]["toolsDependencies"][0]["name"], "xtensa-esp32-elf-gcc");
        assert_eq!(doc["packages"][0]["maintainer"], "bpad");
    }

    #[test]
    fn missing_file_starts_a_fresh_index() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("package_bpad_proto1_index.json");
        let change = update_index_file(&path, &target(), &entry("0.1.0")).unwrap();
        assert_eq!(change, IndexChange::Appended);

        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["packages"][0]["name"], "bpad_proto1");
        assert_eq!(doc["packages"][0]["platforms"][0]["category"], "ESP32");
    }

    #[test]
    fn malformed_index_is_rejected() {
        let mut doc = json!({ "packages": {} });
        let err = merge_entry(&mut doc, &target(), &entry("0.1.0"), Path::new("i.json")).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)), "unexpected err: {err}");
    }
}

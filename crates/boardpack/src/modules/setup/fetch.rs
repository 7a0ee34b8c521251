use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::setup::record::FetchRecord;
use crate::modules::util;

const CHUNK: usize = 1024 * 256;

#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub expected_sha256: Option<&'a str>,
    pub timeout: Duration,
    pub force: bool,
}

// Removes the `.part` file unless the download completed.
struct PartFile {
    path: PathBuf,
    keep: bool,
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Download `req.url` to `req.dest`, reusing a complete earlier download.
pub fn fetch_archive(ctx: &ExecCtx, req: &FetchRequest<'_>) -> Result<FetchRecord> {
    if req.dest.is_file() && !req.force {
        let sha256 = util::sha256_file_hex(req.dest)?;
        match req.expected_sha256 {
            Some(want) if !want.eq_ignore_ascii_case(&sha256) => {
                ctx.log(&format!(
                    "cached {} has sha256 {sha256}, expected {want}; downloading again",
                    req.dest.display()
                ));
            }
            _ => {
                ctx.log(&format!(
                    "found existing {}, skipping download",
                    req.dest.display()
                ));
                return Ok(FetchRecord {
                    url: req.url.to_string(),
                    path: req.dest.to_path_buf(),
                    sha256,
                    size: file_len(req.dest)?,
                    downloaded: false,
                });
            }
        }
    }

    let (sha256, size) = download(ctx, req)?;
    if let Some(want) = req.expected_sha256
        && !want.eq_ignore_ascii_case(&sha256)
    {
        util::remove_file_if_exists(req.dest)?;
        return Err(Error::Network(format!(
            "{} downloaded with sha256 {sha256}, expected {want}",
            req.url
        )));
    }
    Ok(FetchRecord {
        url: req.url.to_string(),
        path: req.dest.to_path_buf(),
        sha256,
        size,
        downloaded: true,
    })
}

fn download(ctx: &ExecCtx, req: &FetchRequest<'_>) -> Result<(String, u64)> {
    ctx.log(&format!("downloading {}", req.url));
    ctx.log(&format!("  -> {}", req.dest.display()));
    if let Some(parent) = req.dest.parent() {
        util::ensure_dir(parent)?;
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(req.timeout)
        .user_agent(format!("boardpack/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(req.url)
        .send()
        .map_err(|e| Error::Network(format!("GET {} failed: {e}", req.url)))?;
    if !res.status().is_success() {
        return Err(Error::Network(format!(
            "GET {} failed with status {}",
            req.url,
            res.status()
        )));
    }
    let total = res.content_length();
    tracing::debug!(url = req.url, ?total, "download started");

    let mut part = PartFile {
        path: part_path(req.dest),
        keep: false,
    };
    let file = File::create(&part.path)
        .map_err(|e| Error::io(format!("failed to create {}", part.path.display()), e))?;
    let mut out = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut received: u64 = 0;
    let mut next_report = report_step(total);

    loop {
        let n = res
            .read(&mut buf)
            .map_err(|e| Error::Network(format!("reading body of {} failed: {e}", req.url)))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])
            .map_err(|e| Error::io(format!("failed to write {}", part.path.display()), e))?;
        hasher.update(&buf[..n]);
        received += n as u64;
        if received >= next_report {
            ctx.log(&progress_line(received, total));
            next_report = received + report_step(total);
        }
    }
    out.flush()
        .map_err(|e| Error::io(format!("failed to flush {}", part.path.display()), e))?;
    drop(out);

    if let Some(total) = total
        && received != total
    {
        return Err(Error::Network(format!(
            "incomplete download of {}: got {received} of {total} bytes",
            req.url
        )));
    }

    fs::rename(&part.path, req.dest).map_err(|e| {
        Error::io(
            format!(
                "failed to move {} -> {}",
                part.path.display(),
                req.dest.display()
            ),
            e,
        )
    })?;
    part.keep = true;
    ctx.log(&format!("download complete ({})", format_mb(received)));
    Ok((hex::encode(hasher.finalize()), received))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn report_step(total: Option<u64>) -> u64 {
    match total {
        Some(t) if t > 0 => (t / 10).max(1),
        _ => 8 * 1024 * 1024,
    }
}

fn progress_line(received: u64, total: Option<u64>) -> String {
    match total {
        Some(t) if t > 0 => format!(
            "progress: {:.1}% ({}/{})",
            (received as f64 * 100.0 / t as f64).min(100.0),
            format_mb(received),
            format_mb(t)
        ),
        _ => format!("progress: {}", format_mb(received)),
    }
}

pub(crate) fn format_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

fn file_len(p: &Path) -> Result<u64> {
    fs::metadata(p)
        .map(|m| m.len())
        .map_err(|e| Error::io(format!("failed to stat {}", p.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_file_sits_next_to_destination() {
        assert_eq!(
            part_path(Path::new("/w/build/downloads/esp32-2.0.17.zip")),
            PathBuf::from("/w/build/downloads/esp32-2.0.17.zip.part")
        );
    }

    #[test]
    fn progress_reports_percent_when_length_known() {
        assert_eq!(
            progress_line(512 * 1024, Some(1024 * 1024)),
            "progress: 50.0% (0.5 MB/1.0 MB)"
        );
        assert_eq!(progress_line(1024 * 1024, None), "progress: 1.0 MB");
    }
}

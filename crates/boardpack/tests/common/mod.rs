#![allow(dead_code)]

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;

use boardpack::config::ConfigDoc;
use boardpack::executor::{ChannelSink, ExecEvent};
use boardpack::planner::{Stage, StageSelect};
use zip::write::SimpleFileOptions;

pub const UPSTREAM_VERSION: &str = "2.0.17";
pub const PARTITIONS: &str = "nvs, data, nvs,...\n";

pub const BASE_CONFIG: &str = r#"
[upstream]
version = "2.0.17"
url = "UPSTREAM_URL/esp32-{version}.zip"

[board]
name = "bpad proto1"

[[overlay.files]]
dst = "boards.txt"
src = "board/boards.txt"

[[overlay.files]]
dst = "variants/bpad_proto1"
src = "board/variants/bpad_proto1"
mode = "create"

[[overlay.files]]
dst = "variants/bpad_proto1/partitions.csv"
content = "nvs, data, nvs,...\n"
mode = "create"

[[overlay.patches]]
path = "platform.txt"
find = "name=ESP32 Arduino"
replace = "name={board.name} (ESP32 v{upstream.version})"

[[overlay.patches]]
path = "platform.txt"
find = "version={upstream.version}"
replace = "version={package.version}"

[package]
name = "bpad_proto1"
version = "0.1.0"
archive_name = "{package}-v{version}.zip"
url = "https://example.invalid/releases/v{version}/{archive}"

[package.index]
path = "package_bpad_proto1_index.json"
"#;

/// Upstream release layout: a single `esp32-<version>/` directory.
pub fn upstream_zip_bytes() -> Vec<u8> {
    let mut zw = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let top = format!("esp32-{UPSTREAM_VERSION}");
    zw.add_directory(format!("{top}/"), SimpleFileOptions::default())
        .unwrap();
    for (name, data) in [
        ("platform.txt", "name=ESP32 Arduino\nversion=2.0.17\n"),
        ("boards.txt", "esp32.name=ESP32 Dev Module\n"),
        ("variants/esp32/pins_arduino.h", "#define LED_BUILTIN 2\n"),
        ("tools/partitions/default.csv", "nvs, data, nvs, 0x9000, 0x5000,\n"),
    ] {
        zw.start_file(format!("{top}/{name}"), SimpleFileOptions::default())
            .unwrap();
        zw.write_all(data.as_bytes()).unwrap();
    }
    zw.start_file(
        format!("{top}/tools/esptool.py"),
        SimpleFileOptions::default().unix_permissions(0o755),
    )
    .unwrap();
    zw.write_all(b"#!/usr/bin/env python3\n").unwrap();
    zw.finish().unwrap().into_inner()
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    /// Workspace with board files and `boardpack.toml`; the upstream archive
    /// is pre-seeded into the download cache so no network is needed.
    pub fn new() -> Self {
        Self::with_config(BASE_CONFIG, "http://127.0.0.1:9", true)
    }

    pub fn with_config(config: &str, upstream_base: &str, seed_download: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        write(root, "board/boards.txt", "bpad_proto1.name=bpad proto1\n");
        write(
            root,
            "board/variants/bpad_proto1/pins_arduino.h",
            "#define LED_BUILTIN 13\n",
        );
        write(
            root,
            "boardpack.toml",
            &config.replace("UPSTREAM_URL", upstream_base),
        );
        if seed_download {
            let dl = root.join("build/downloads");
            fs::create_dir_all(&dl).unwrap();
            fs::write(
                dl.join(format!("esp32-{UPSTREAM_VERSION}.zip")),
                upstream_zip_bytes(),
            )
            .unwrap();
        }
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn doc(&self) -> ConfigDoc {
        boardpack::config::load(&self.path("boardpack.toml")).expect("load config")
    }

    pub fn setup(&self) -> (boardpack::Result<()>, Vec<ExecEvent>) {
        run(&self.doc(), StageSelect::Only(Stage::Setup))
    }

    pub fn build(&self) -> (boardpack::Result<()>, Vec<ExecEvent>) {
        run(&self.doc(), StageSelect::Only(Stage::Package))
    }

    pub fn state_json(&self) -> Option<serde_json::Value> {
        let raw = fs::read_to_string(self.path("build/setup/state.json")).ok()?;
        Some(serde_json::from_str(&raw).expect("state.json"))
    }

    pub fn release_zips(&self) -> Vec<String> {
        let Ok(rd) = fs::read_dir(self.path("release")) else {
            return Vec::new();
        };
        let mut out: Vec<String> = rd
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".zip"))
            .collect();
        out.sort();
        out
    }
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, content).unwrap();
}

pub fn run(doc: &ConfigDoc, select: StageSelect) -> (boardpack::Result<()>, Vec<ExecEvent>) {
    let (tx, rx) = mpsc::channel();
    let res = boardpack::run_stage(doc, select, false, Arc::new(ChannelSink::new(tx)));
    (res, rx.try_iter().collect())
}

pub fn started_ids(events: &[ExecEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskStarted { id } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

pub fn read_zip_entry(path: &Path, name: &str) -> String {
    let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut out = String::new();
    zip.by_name(name).unwrap().read_to_string(&mut out).unwrap();
    out
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

/// Serve `body` with `status` to each of the next `requests` connections.
/// Returns the base URL.
pub fn serve(status: &'static str, body: Vec<u8>, requests: usize) -> String {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = l.local_addr().unwrap();
    thread::spawn(move || {
        for stream in l.incoming().take(requests) {
            let Ok(mut s) = stream else {
                continue;
            };
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                match s.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => req.extend_from_slice(&buf[..n]),
                }
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/zip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = s.write_all(head.as_bytes());
            let _ = s.write_all(&body);
            let _ = s.flush();
        }
    });
    format!("http://{addr}")
}

mod common;

use std::fs;

use boardpack::Error;
use common::{Fixture, PARTITIONS, read_zip_entry, started_ids};

#[test]
fn setup_then_build_produces_archive_manifest_and_index() {
    let fx = Fixture::new();

    let (res, events) = fx.setup();
    res.expect("setup");
    assert_eq!(
        started_ids(&events),
        [
            "core.init",
            "setup.fetch",
            "setup.extract",
            "setup.overlay",
            "setup.seal"
        ]
    );
    assert_eq!(
        fs::read_to_string(fx.path("esp32/variants/bpad_proto1/partitions.csv")).unwrap(),
        PARTITIONS
    );
    assert_eq!(
        fs::read_to_string(fx.path("esp32/platform.txt")).unwrap(),
        "name=bpad proto1 (ESP32 v2.0.17)\nversion=0.1.0\n"
    );
    let state = fx.state_json().expect("state.json written");
    assert_eq!(state["upstream_version"], "2.0.17");
    assert!(state["overlays"]["boards.txt"].is_string());

    let (res, events) = fx.build();
    res.expect("build");
    assert_eq!(
        started_ids(&events),
        [
            "core.init",
            "package.verify",
            "package.archive",
            "package.manifest"
        ]
    );
    assert_eq!(fx.release_zips(), ["bpad_proto1-v0.1.0.zip"]);

    let zip_path = fx.path("release/bpad_proto1-v0.1.0.zip");
    assert_eq!(
        read_zip_entry(&zip_path, "esp32/variants/bpad_proto1/partitions.csv"),
        PARTITIONS
    );
    assert_eq!(
        read_zip_entry(&zip_path, "esp32/boards.txt"),
        "bpad_proto1.name=bpad proto1\n"
    );

    let bytes = fs::read(&zip_path).unwrap();
    let sha = boardpack::modules::util::sha256_hex(&bytes);
    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.path("release/bpad_proto1-v0.1.0.zip.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["checksum"], format!("SHA-256:{sha}"));
    assert_eq!(manifest["size"], bytes.len().to_string());
    assert_eq!(manifest["archiveFileName"], "bpad_proto1-v0.1.0.zip");
    assert_eq!(
        manifest["url"],
        "https://example.invalid/releases/v0.1.0/bpad_proto1-v0.1.0.zip"
    );

    let index: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.path("package_bpad_proto1_index.json")).unwrap(),
    )
    .unwrap();
    let platform = &index["packages"][0]["platforms"][0];
    assert_eq!(platform["name"], "bpad proto1");
    assert_eq!(platform["architecture"], "esp32");
    assert_eq!(platform["checksum"], format!("SHA-256:{sha}"));
}

#[cfg(unix)]
#[test]
fn archive_normalizes_permissions() {
    let fx = Fixture::new();
    fx.setup().0.expect("setup");
    fx.build().0.expect("build");

    let file = fs::File::open(fx.path("release/bpad_proto1-v0.1.0.zip")).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let mode = |zip: &mut zip::ZipArchive<fs::File>, name: &str| {
        zip.by_name(name).unwrap().unix_mode().unwrap() & 0o777
    };
    assert_eq!(mode(&mut zip, "esp32/tools/esptool.py"), 0o755);
    assert_eq!(mode(&mut zip, "esp32/platform.txt"), 0o644);
    assert_eq!(mode(&mut zip, "esp32/variants/"), 0o755);
}

#[test]
fn setup_twice_yields_identical_trees_and_archives() {
    let fx = Fixture::new();
    fx.setup().0.expect("first setup");
    let first = fx.state_json().unwrap()["tree_digest"].clone();
    fx.build().0.expect("first build");
    let first_zip = fs::read(fx.path("release/bpad_proto1-v0.1.0.zip")).unwrap();

    fx.setup().0.expect("second setup");
    let second = fx.state_json().unwrap()["tree_digest"].clone();
    assert_eq!(first, second);
    fx.build().0.expect("second build");
    let second_zip = fs::read(fx.path("release/bpad_proto1-v0.1.0.zip")).unwrap();
    assert_eq!(
        boardpack::modules::util::sha256_hex(&first_zip),
        boardpack::modules::util::sha256_hex(&second_zip)
    );

    // A second build of the same version rewrites the index entry in place.
    let index: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.path("package_bpad_proto1_index.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        index["packages"][0]["platforms"].as_array().unwrap().len(),
        1
    );
}

#[test]
fn build_before_setup_is_a_precondition_failure() {
    let fx = Fixture::new();
    let (res, events) = fx.build();
    let err = res.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)), "unexpected err: {err}");
    assert_eq!(err.exit_code(), 5);
    assert_eq!(started_ids(&events), ["core.init", "package.verify"]);
    assert!(fx.release_zips().is_empty());
}

#[test]
fn tree_edited_after_setup_blocks_the_build() {
    let fx = Fixture::new();
    fx.setup().0.expect("setup");
    fs::write(fx.path("esp32/boards.txt"), "edited by hand\n").unwrap();

    let err = fx.build().0.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)), "unexpected err: {err}");
    assert!(err.to_string().contains("boards.txt"), "unexpected err: {err}");
    assert!(fx.release_zips().is_empty());
}

#[test]
fn unrelated_edit_is_caught_by_the_tree_digest() {
    let fx = Fixture::new();
    fx.setup().0.expect("setup");
    fs::write(fx.path("esp32/tools/partitions/default.csv"), "changed\n").unwrap();
    let err = fx.build().0.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)), "unexpected err: {err}");
}

#[test]
fn shifted_upstream_layout_is_a_layout_mismatch() {
    let config = common::BASE_CONFIG.replace(
        "dst = \"boards.txt\"\nsrc = \"board/boards.txt\"",
        "dst = \"board/boards.txt\"\nsrc = \"board/boards.txt\"",
    );
    let fx = Fixture::with_config(&config, "http://127.0.0.1:9", true);
    let (res, events) = fx.setup();
    let err = res.unwrap_err();
    assert!(matches!(err, Error::LayoutMismatch(_)), "unexpected err: {err}");
    assert_eq!(err.exit_code(), 4);
    assert!(!started_ids(&events).contains(&"setup.seal".to_string()));
    assert!(fx.state_json().is_none());
}

#[test]
fn stale_setup_record_is_dropped_when_setup_fails() {
    let fx = Fixture::new();
    fx.setup().0.expect("setup");
    assert!(fx.state_json().is_some());

    // Corrupt the cached archive; the next setup must not leave the old record.
    fs::write(fx.path("build/downloads/esp32-2.0.17.zip"), b"not a zip").unwrap();
    let err = fx.setup().0.unwrap_err();
    assert!(matches!(err, Error::Archive(_)), "unexpected err: {err}");
    assert!(fx.state_json().is_none());

    let err = fx.build().0.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)), "unexpected err: {err}");
}

#[test]
fn dry_run_touches_nothing() {
    let fx = Fixture::new();
    let doc = fx.doc();
    let (tx, rx) = std::sync::mpsc::channel();
    boardpack::run_stage(
        &doc,
        boardpack::planner::StageSelect::Only(boardpack::planner::Stage::Setup),
        true,
        std::sync::Arc::new(boardpack::executor::ChannelSink::new(tx)),
    )
    .expect("dry run");
    assert!(rx.try_iter().count() > 0);
    assert!(!fx.path("esp32").exists());
    assert!(fx.state_json().is_none());
}

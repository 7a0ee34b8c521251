mod common;

use std::fs;

use boardpack::Error;
use common::{BASE_CONFIG, Fixture, closed_port, serve, started_ids, upstream_zip_bytes};

#[test]
fn unreachable_host_is_a_network_error_and_leaves_no_record() {
    let base = format!("http://127.0.0.1:{}", closed_port());
    let fx = Fixture::with_config(BASE_CONFIG, &base, false);

    let (res, events) = fx.setup();
    let err = res.unwrap_err();
    assert!(matches!(err, Error::Network(_)), "unexpected err: {err}");
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("setup.fetch"), "unexpected err: {err}");
    assert_eq!(started_ids(&events), ["core.init", "setup.fetch"]);
    assert!(fx.state_json().is_none());
    assert!(!fx.path("build/downloads/esp32-2.0.17.zip").exists());
    assert!(!fx.path("build/downloads/esp32-2.0.17.zip.part").exists());
}

#[test]
fn downloads_and_caches_the_upstream_archive() {
    let body = upstream_zip_bytes();
    let base = serve("200 OK", body.clone(), 1);
    let fx = Fixture::with_config(BASE_CONFIG, &base, false);

    fx.setup().0.expect("setup with download");
    let cached = fs::read(fx.path("build/downloads/esp32-2.0.17.zip")).unwrap();
    assert_eq!(cached, body);

    let fetch: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.path("build/setup/fetch.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(fetch["downloaded"], true);
    assert_eq!(fetch["size"], body.len() as u64);
    assert_eq!(
        fetch["sha256"],
        boardpack::modules::util::sha256_hex(&body)
    );

    // The server only answers once; a second setup must reuse the cache.
    fx.setup().0.expect("setup from cache");
    assert!(fx.state_json().is_some());
}

#[test]
fn http_error_status_is_a_network_error() {
    let base = serve("404 Not Found", b"missing".to_vec(), 1);
    let fx = Fixture::with_config(BASE_CONFIG, &base, false);
    let err = fx.setup().0.unwrap_err();
    assert!(matches!(err, Error::Network(_)), "unexpected err: {err}");
    assert!(err.to_string().contains("404"), "unexpected err: {err}");
    assert!(!fx.path("build/downloads/esp32-2.0.17.zip").exists());
}

#[test]
fn pinned_checksum_mismatch_discards_the_download() {
    let config = BASE_CONFIG.replace(
        "url = \"UPSTREAM_URL/esp32-{version}.zip\"",
        &format!(
            "url = \"UPSTREAM_URL/esp32-{{version}}.zip\"\nsha256 = \"{}\"",
            "0".repeat(64)
        ),
    );
    let base = serve("200 OK", upstream_zip_bytes(), 1);
    let fx = Fixture::with_config(&config, &base, false);

    let err = fx.setup().0.unwrap_err();
    assert!(matches!(err, Error::Network(_)), "unexpected err: {err}");
    assert!(!fx.path("build/downloads/esp32-2.0.17.zip").exists());
    assert!(fx.state_json().is_none());
}

use std::fs;
use std::io::Cursor;
use std::path::Path;

use semver::Version;

use super::*;

#[test]
fn parse_manifest() {
    let content = r#"
post_update_commands = "$refreshicons()"
obsolete_folders = ["base/plugins/legacy"]
previous_desktop_shortcuts = ["comdesktop/App.lnk"]

[[files]]
path = "base/app.exe"
execute = { before_install = false, wait_for_exit = true, args = "--migrate %basedir%" }

[[files]]
path = "base/lib.dll"
delta = "temp/patches/lib.dll.delta"
target_crc32 = 305419896

[[files]]
path = "base/old-tool.exe"
delete = true

[[registry]]
op = "create_value"
hive = "current_user"
key = "Software/Example/App"
value_name = "InstallDir"
kind = "string"
data = ["%basedir%"]

[[shortcuts]]
path = "comdesktop/App.lnk"
target = "base/app.exe"
description = "Example App"
"#;

    let manifest = UpdateManifest::from_toml_str(content).expect("manifest should parse");
    assert_eq!(manifest.files.len(), 3);
    assert_eq!(manifest.files[0].path, "base/app.exe");
    assert!(manifest.files[0]
        .execute
        .as_ref()
        .expect("execute spec")
        .wait_for_exit);
    assert_eq!(
        manifest.files[1].delta.as_deref(),
        Some("temp/patches/lib.dll.delta")
    );
    assert_eq!(manifest.files[1].target_crc32, Some(0x12345678));
    assert!(manifest.files[2].delete);
    assert_eq!(manifest.registry.len(), 1);
    assert!(manifest.has_registry_operations());
    assert_eq!(manifest.registry[0].op, RegOpKind::CreateValue);
    assert_eq!(manifest.registry[0].hive, RegHive::CurrentUser);
    assert_eq!(manifest.shortcuts.len(), 1);
    assert_eq!(manifest.obsolete_folders, vec!["base/plugins/legacy"]);
    assert_eq!(manifest.post_update_commands, "$refreshicons()");
}

#[test]
fn manifest_rejects_delta_without_checksum() {
    let content = r#"
[[files]]
path = "base/lib.dll"
delta = "temp/patches/lib.dll.delta"
"#;
    let err = UpdateManifest::from_toml_str(content).expect_err("must reject");
    assert!(err.to_string().contains("no expected checksum"));
}

#[test]
fn manifest_rejects_value_op_without_name() {
    let content = r#"
[[registry]]
op = "create_value"
hive = "current_user"
key = "Software/Example"
kind = "string"
data = ["x"]
"#;
    let err = UpdateManifest::from_toml_str(content).expect_err("must reject");
    assert!(err.to_string().contains("missing a value name"));
}

#[test]
fn empty_manifest_has_no_registry_operations() {
    let manifest = UpdateManifest::from_toml_str("").expect("empty manifest is valid");
    assert!(!manifest.has_registry_operations());
    assert!(manifest.files.is_empty());
}

#[test]
fn parse_catalog_and_pick_packages() {
    let content = r#"
app_name = "example"
latest_version = "2.1.0"
minimum_client_version = "1.4.0"

[client_update]
urls = ["https://mirror.test/client-2.0.zip"]
sha256 = "cafe"

[[updates]]
from_version = "2.0.0"
urls = ["https://mirror.test/2.0.0-to-2.1.0.zip"]
sha256 = "beef"

[[updates]]
urls = ["https://mirror.test/full-2.1.0.zip", "https://mirror2.test/full-2.1.0.zip"]
sha256 = "f00d"
"#;

    let catalog = AppCatalog::from_toml_str(content).expect("catalog should parse");
    assert_eq!(catalog.latest_version, Version::new(2, 1, 0));

    let exact = catalog
        .package_for(Some(&Version::new(2, 0, 0)))
        .expect("diff package");
    assert_eq!(exact.sha256, "beef");

    let fallback = catalog
        .package_for(Some(&Version::new(1, 0, 0)))
        .expect("catch-all package");
    assert_eq!(fallback.sha256, "f00d");
    assert_eq!(fallback.urls.len(), 2);

    assert!(catalog.client_needs_update(&Version::new(1, 3, 9)));
    assert!(!catalog.client_needs_update(&Version::new(1, 4, 0)));
}

#[test]
fn catalog_rejects_empty_mirror_list() {
    let content = r#"
app_name = "example"
latest_version = "2.1.0"
minimum_client_version = "1.0.0"

[[updates]]
urls = []
sha256 = "f00d"
"#;
    let err = AppCatalog::from_toml_str(content).expect_err("must reject");
    assert!(err.to_string().contains("without mirror urls"));
}

#[test]
fn split_tagged_paths() {
    assert_eq!(
        split_tagged("base/app.exe"),
        Some((TargetClass::Base, "app.exe"))
    );
    assert_eq!(
        split_tagged("comstartmenu\\App\\App.lnk"),
        Some((TargetClass::CommonStartMenu, "App\\App.lnk"))
    );
    assert_eq!(split_tagged("temp/patches/x"), Some((TargetClass::Temp, "patches/x")));
    assert_eq!(split_tagged("bogus/app.exe"), None);
    assert_eq!(split_tagged("ba"), None);
    assert_eq!(split_tagged(""), None);
}

#[test]
fn resolve_tagged_paths() {
    let targets = InstallTargets::rooted_under(Path::new("/install"));
    let scratch = Path::new("/scratch");

    assert_eq!(
        targets.resolve(scratch, "base/bin/app.exe"),
        Some(Path::new("/install/base/bin/app.exe").to_path_buf())
    );
    assert_eq!(
        targets.resolve(scratch, "comdesktop\\App.lnk"),
        Some(Path::new("/install/comdesktop/App.lnk").to_path_buf())
    );
    // temp keeps its full tagged form under the scratch root
    assert_eq!(
        targets.resolve(scratch, "temp/patches/lib.delta"),
        Some(Path::new("/scratch/temp/patches/lib.delta").to_path_buf())
    );
    assert_eq!(targets.resolve(scratch, "unknown/file"), None);
}

#[test]
fn delta_round_trip_reproduces_target() {
    let original: Vec<u8> = (0u32..40_000).map(|i| (i % 251) as u8).collect();
    let mut target = original.clone();
    // mutate a few regions and append a tail
    target[1_000..1_050].fill(0xAB);
    target.splice(20_000..20_000, b"inserted-run".iter().copied());
    target.extend_from_slice(b"trailing bytes that never existed in the original");

    let delta = encode_delta(&original, &target);

    let mut decoded = Vec::new();
    decode_delta(
        &mut Cursor::new(&original),
        &mut Cursor::new(&delta),
        &mut decoded,
    )
    .expect("decode must succeed");
    assert_eq!(decoded, target);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&decoded);
    let decoded_crc = hasher.finalize();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&target);
    assert_eq!(decoded_crc, hasher.finalize());
}

#[test]
fn delta_with_unrelated_inputs_is_pure_insert() {
    let original = b"completely unrelated".to_vec();
    let target: Vec<u8> = (0u32..5_000).map(|i| (i % 13) as u8).collect();

    let delta = encode_delta(&original, &target);
    let mut decoded = Vec::new();
    decode_delta(
        &mut Cursor::new(&original),
        &mut Cursor::new(&delta),
        &mut decoded,
    )
    .expect("decode must succeed");
    assert_eq!(decoded, target);
}

#[test]
fn delta_rejects_bad_magic_and_truncation() {
    let original = vec![0u8; 4096];
    let target = vec![1u8; 4096];
    let delta = encode_delta(&original, &target);

    let mut bad = delta.clone();
    bad[0] = b'X';
    let err = decode_delta(
        &mut Cursor::new(&original),
        &mut Cursor::new(&bad),
        &mut Vec::new(),
    )
    .expect_err("bad magic must fail");
    assert!(err.to_string().contains("invalid magic"));

    let truncated = &delta[..delta.len() - 2];
    decode_delta(
        &mut Cursor::new(&original),
        &mut Cursor::new(truncated),
        &mut Vec::new(),
    )
    .expect_err("truncated stream must fail");
}

#[test]
fn corrupted_delta_output_is_caught_by_checksum() {
    let original: Vec<u8> = (0u32..10_000).map(|i| (i % 199) as u8).collect();
    let mut target = original.clone();
    target.extend_from_slice(b"new tail");

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&target);
    let expected = hasher.finalize();

    let mut delta = encode_delta(&original, &target);
    // flip one byte inside an insert payload
    let flip_at = delta.len() - 4;
    delta[flip_at] ^= 0xFF;

    let mut decoded = Vec::new();
    let result = decode_delta(
        &mut Cursor::new(&original),
        &mut Cursor::new(&delta),
        &mut decoded,
    );
    if result.is_ok() {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&decoded);
        assert_ne!(hasher.finalize(), expected, "corruption must not verify");
    }
}

#[test]
fn checksum_helpers_match_known_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("payload.bin");
    fs::write(&path, b"hello world").expect("write payload");

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(b"hello world");
    assert_eq!(crc32_of_file(&path).expect("crc"), hasher.finalize());

    assert_eq!(
        sha256_hex_of_file(&path).expect("sha256"),
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
}

#[test]
fn expand_resolves_and_guards_self_reference() {
    let resolver = |name: &str| -> Option<String> {
        match name {
            "basedir" => Some("/opt/app".to_string()),
            "nested" => Some("%basedir%/bin".to_string()),
            "loop" => Some("%loop%!".to_string()),
            _ => None,
        }
    };

    assert_eq!(expand("no variables", &resolver), "no variables");
    assert_eq!(expand("%basedir%/data", &resolver), "/opt/app/data");
    assert_eq!(expand("run %NESTED%", &resolver), "run /opt/app/bin");
    // undefined names keep their literal form
    assert_eq!(expand("keep %unknown% text", &resolver), "keep %unknown% text");
    // a dangling percent sign is preserved
    assert_eq!(expand("50% done", &resolver), "50% done");
    // self-referential definitions terminate with the inner reference kept
    assert_eq!(expand("%loop%", &resolver), "%loop%!");
}

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use semver::Version;
use zip::write::SimpleFileOptions;

use replift_core::{
    InstallTargets, RegHive, RegOpKind, RegValueKind, RegistryOperation, UpdateManifest,
};

use super::*;

fn crc32_of(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn build_archive(path: &Path, entries: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("archive parent must exist");
    }
    let file = fs::File::create(path).expect("archive must be writable");
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, data) in entries {
        zip.start_file(*name, options).expect("zip entry must start");
        zip.write_all(data).expect("zip entry must write");
    }
    zip.finish().expect("zip must finish");
}

fn value_op(key: &str, name: &str, data: &str) -> RegistryOperation {
    RegistryOperation {
        op: RegOpKind::CreateValue,
        hive: RegHive::CurrentUser,
        key: key.to_string(),
        value_name: Some(name.to_string()),
        kind: Some(RegValueKind::String),
        data: vec![data.to_string()],
    }
}

#[test]
fn step_sequence_is_linear_when_everything_is_present() {
    let mut steps = vec![UpdateStep::DownloadClientUpdate];
    while let Some(next) = next_step(*steps.last().expect("non-empty"), true, true) {
        steps.push(next);
    }
    assert_eq!(steps, UpdateStep::ALL.to_vec());
}

#[test]
fn missing_manifest_skips_the_execute_block() {
    assert_eq!(
        next_step(UpdateStep::ClosingProcesses, false, false),
        Some(UpdateStep::WriteManifest)
    );
}

#[test]
fn empty_registry_skips_modify_reg() {
    assert_eq!(
        next_step(UpdateStep::BackingUp, true, false),
        Some(UpdateStep::OptimizeExecute)
    );
    assert_eq!(
        next_step(UpdateStep::BackingUp, true, true),
        Some(UpdateStep::ModifyReg)
    );
}

#[test]
fn overall_percent_stays_in_range_and_orders_steps() {
    let early = overall_percent(UpdateStep::Extract, 100);
    let late = overall_percent(UpdateStep::WriteManifest, 0);
    assert!(early < late);
    assert_eq!(overall_percent(UpdateStep::DownloadClientUpdate, 0), 0);
    assert!(overall_percent(UpdateStep::DeletingTemp, 100) <= 100);
}

#[test]
fn file_ledger_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = dir.path().join("files.ledger");

    append_file_entry(&ledger, &FileLedgerEntry::CreatedFile("/a/b.txt".into()))
        .expect("append must succeed");
    append_file_entry(&ledger, &FileLedgerEntry::CreatedDir("/a/c".into()))
        .expect("append must succeed");

    let entries = read_file_entries(&ledger).expect("ledger must parse");
    assert_eq!(
        entries,
        vec![
            FileLedgerEntry::CreatedFile("/a/b.txt".into()),
            FileLedgerEntry::CreatedDir("/a/c".into()),
        ]
    );

    let missing = read_file_entries(&dir.path().join("absent.ledger")).expect("missing is empty");
    assert!(missing.is_empty());
}

#[test]
fn registry_op_serialization_round_trips() {
    let op = RegistryOperation {
        op: RegOpKind::CreateValue,
        hive: RegHive::LocalMachine,
        key: "Software/Example/App".to_string(),
        value_name: Some("Install Dir".to_string()),
        kind: Some(RegValueKind::MultiString),
        data: vec!["with\ttab".to_string(), "with\nnewline".to_string()],
    };

    let line = serialize_registry_op(&op);
    assert!(!line.contains('\n'));
    let parsed = parse_registry_op(&line).expect("ledger line must parse");
    assert_eq!(parsed, op);

    let bare = RegistryOperation {
        op: RegOpKind::DeleteKey,
        hive: RegHive::CurrentUser,
        key: "Software/Example".to_string(),
        value_name: None,
        kind: None,
        data: Vec::new(),
    };
    let parsed = parse_registry_op(&serialize_registry_op(&bare)).expect("must parse");
    assert_eq!(parsed, bare);
}

#[test]
fn install_then_rollback_restores_the_destination_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    // pre-existing installation: one file that will be overwritten
    let base = targets.base().to_path_buf();
    fs::create_dir_all(base.join("plugins")).expect("target tree");
    fs::write(base.join("app.cfg"), b"old config").expect("seed file");
    let old_mtime = fs::metadata(base.join("app.cfg"))
        .expect("seed metadata")
        .modified()
        .expect("seed mtime");

    // staged update: overwrites app.cfg, adds a new file and a new dir
    let staged = layout.class_dir(replift_core::TargetClass::Base);
    fs::write(staged.join("app.cfg"), b"new config").expect("stage file");
    fs::create_dir_all(staged.join("data")).expect("stage dir");
    fs::write(staged.join("data").join("seed.db"), b"seed").expect("stage file");

    let cancel = CancelFlag::new();
    let outcome =
        install_files(&layout, &targets, &cancel, &NullProgress).expect("install must succeed");
    assert_eq!(outcome, StageOutcome::Completed);
    assert_eq!(
        fs::read(base.join("app.cfg")).expect("installed file"),
        b"new config"
    );
    assert_eq!(
        fs::read(base.join("data").join("seed.db")).expect("created file"),
        b"seed"
    );

    rollback_files(&layout, &targets).expect("rollback must succeed");

    assert_eq!(
        fs::read(base.join("app.cfg")).expect("restored file"),
        b"old config"
    );
    let restored_mtime = fs::metadata(base.join("app.cfg"))
        .expect("restored metadata")
        .modified()
        .expect("restored mtime");
    assert_eq!(restored_mtime, old_mtime);
    assert!(!base.join("data").exists(), "created dir must be gone");
    assert!(!layout.file_ledger_path().exists(), "ledger must be gone");
}

#[test]
fn overwritten_shortcut_is_restored_by_rollback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    let desktop = dir.path().join("install").join("comdesktop");
    fs::create_dir_all(&desktop).expect("desktop dir");
    fs::write(desktop.join("App.lnk"), b"target=/old/app\n").expect("seed shortcut");

    let manifest = UpdateManifest::from_toml_str(
        r#"
[[shortcuts]]
path = "comdesktop/App.lnk"
target = "base/app.exe"
"#,
    )
    .expect("manifest should parse");

    create_shortcuts(&manifest, &targets, &layout, &FsShellOps).expect("shortcuts must write");
    let written = fs::read_to_string(desktop.join("App.lnk")).expect("new shortcut");
    assert!(written.contains("app.exe"), "shortcut must point at the new target");

    rollback_files(&layout, &targets).expect("rollback must succeed");
    assert_eq!(
        fs::read(desktop.join("App.lnk")).expect("restored shortcut"),
        b"target=/old/app\n"
    );
}

#[test]
fn brand_new_shortcut_tree_is_removed_by_rollback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    // the desktop root itself does not exist yet
    let desktop = dir.path().join("install").join("comdesktop");
    assert!(!desktop.exists());

    let manifest = UpdateManifest::from_toml_str(
        r#"
[[shortcuts]]
path = "comdesktop/App.lnk"
target = "base/app.exe"
"#,
    )
    .expect("manifest should parse");

    create_shortcuts(&manifest, &targets, &layout, &FsShellOps).expect("shortcuts must write");
    assert!(desktop.join("App.lnk").is_file());

    rollback_files(&layout, &targets).expect("rollback must succeed");
    assert!(
        !desktop.exists(),
        "a desktop root created for the shortcut must be gone after rollback"
    );
}

#[test]
fn obsolete_folder_comes_back_on_rollback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    let menu = dir.path().join("install").join("comstartmenu");
    fs::create_dir_all(menu.join("Demo")).expect("menu dir");
    fs::write(menu.join("Demo").join("Old.lnk"), b"target=/old/tool\n").expect("seed shortcut");

    let manifest = UpdateManifest::from_toml_str(
        r#"obsolete_folders = ["comstartmenu/Demo"]"#,
    )
    .expect("manifest should parse");

    remove_obsolete_folders(&manifest, &targets, &layout).expect("removal must succeed");
    assert!(!menu.join("Demo").exists(), "obsolete folder must be removed");

    rollback_files(&layout, &targets).expect("rollback must succeed");
    assert_eq!(
        fs::read(menu.join("Demo").join("Old.lnk")).expect("restored shortcut"),
        b"target=/old/tool\n"
    );
}

#[test]
fn fresh_class_root_is_removed_on_rollback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    fs::create_dir_all(targets.base()).expect("base root");

    // only the appdata class has staged content, and its root is absent
    let staged = layout.class_dir(replift_core::TargetClass::AppData);
    fs::write(staged.join("settings.toml"), b"theme = 'dark'").expect("stage file");
    let appdata = dir.path().join("install").join("appdata");
    assert!(!appdata.exists());

    let cancel = CancelFlag::new();
    let outcome =
        install_files(&layout, &targets, &cancel, &NullProgress).expect("install must succeed");
    assert_eq!(outcome, StageOutcome::Completed);
    assert!(appdata.join("settings.toml").is_file());

    rollback_files(&layout, &targets).expect("rollback must succeed");
    assert!(!appdata.exists(), "a root created by the install must be gone");
    assert!(targets.base().is_dir(), "pre-existing roots stay");
}

struct CancelAfterFirst {
    cancel: CancelFlag,
    seen: AtomicUsize,
}

impl ProgressSink for CancelAfterFirst {
    fn report(&self, _percent: i32, _message: &str) {
        if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
            self.cancel.cancel();
        }
    }
}

#[test]
fn cancellation_between_files_unwinds_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    let base = targets.base().to_path_buf();
    fs::create_dir_all(&base).expect("target tree");
    fs::write(base.join("one.txt"), b"original one").expect("seed file");

    let staged = layout.class_dir(replift_core::TargetClass::Base);
    fs::write(staged.join("one.txt"), b"updated one").expect("stage file");
    fs::write(staged.join("two.txt"), b"brand new").expect("stage file");

    let cancel = CancelFlag::new();
    let sink = CancelAfterFirst {
        cancel: cancel.clone(),
        seen: AtomicUsize::new(0),
    };
    let outcome = install_files(&layout, &targets, &cancel, &sink).expect("install must not error");
    assert_eq!(outcome, StageOutcome::Cancelled);

    rollback_files(&layout, &targets).expect("rollback must succeed");
    assert_eq!(
        fs::read(base.join("one.txt")).expect("restored file"),
        b"original one"
    );
    assert!(!base.join("two.txt").exists(), "created file must be gone");
}

#[test]
fn registry_apply_then_rollback_restores_prior_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = FsRegistryStore::new(dir.path().join("registry"));
    let ledger = dir.path().join("registry.ledger");

    // pre-existing state: one value that will be overwritten, one that
    // will be deleted
    apply_op(&mut store, &value_op("Software/App", "Keep", "before"))
        .expect("seed value");
    apply_op(&mut store, &value_op("Software/App", "Doomed", "bye"))
        .expect("seed value");

    let ops = vec![
        value_op("Software/App", "Keep", "after"),
        RegistryOperation {
            op: RegOpKind::DeleteValue,
            hive: RegHive::CurrentUser,
            key: "Software/App".to_string(),
            value_name: Some("Doomed".to_string()),
            kind: None,
            data: Vec::new(),
        },
        value_op("Software/App/Fresh", "New", "value"),
    ];

    let resolver = |_: &str| -> Option<String> { None };
    let plan = plan_registry(&store, &ops, &resolver).expect("plan must build");
    apply_plan(&mut store, &plan, &ledger).expect("apply must succeed");

    assert_eq!(
        store
            .get_value(RegHive::CurrentUser, "Software/App", "Keep")
            .expect("get")
            .expect("present")
            .data,
        vec!["after".to_string()]
    );
    assert!(store
        .get_value(RegHive::CurrentUser, "Software/App", "Doomed")
        .expect("get")
        .is_none());

    rollback_registry(&mut store, &ledger).expect("rollback must succeed");

    assert_eq!(
        store
            .get_value(RegHive::CurrentUser, "Software/App", "Keep")
            .expect("get")
            .expect("present")
            .data,
        vec!["before".to_string()]
    );
    assert_eq!(
        store
            .get_value(RegHive::CurrentUser, "Software/App", "Doomed")
            .expect("get")
            .expect("present")
            .data,
        vec!["bye".to_string()]
    );
    assert!(
        !store
            .key_exists(RegHive::CurrentUser, "Software/App/Fresh")
            .expect("key check"),
        "created key must be gone"
    );
    assert!(!ledger.exists(), "ledger must be gone");
}

#[test]
fn registry_plan_expands_string_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FsRegistryStore::new(dir.path().join("registry"));
    let resolver = |name: &str| -> Option<String> {
        (name == "basedir").then(|| "/opt/demo".to_string())
    };

    let plan = plan_registry(
        &store,
        &[value_op("Software/App", "InstallDir", "%basedir%")],
        &resolver,
    )
    .expect("plan must build");
    assert_eq!(plan.ops[0].forward.data, vec!["/opt/demo".to_string()]);
}

#[test]
fn handoff_round_trips_and_is_consumed_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("handoff.bin");

    let handoff = SelfUpdateHandoff {
        state_path: "/opt/demo/client.state".into(),
        catalog_path: "/opt/demo/catalog.toml".into(),
        client_catalog_path: None,
        base_dir: "/opt/demo".into(),
        scratch_dir: "/tmp/demo-update".into(),
        current_exe: "/opt/demo/demo".into(),
        will_self_update: true,
        needs_elevation: false,
        catalog_override: Some("https://mirror.test/catalog.toml".to_string()),
    };
    handoff.write(&path).expect("handoff must write");

    let read_back = SelfUpdateHandoff::consume(&path).expect("handoff must read");
    assert_eq!(read_back, handoff);
    assert!(!path.exists(), "consume must remove the handoff");
    SelfUpdateHandoff::consume(&path).expect_err("second consume must fail");
}

#[test]
fn stray_staged_client_is_dropped_before_install() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    let current_exe = targets.base().join("demo");
    let staged = layout.class_dir(replift_core::TargetClass::Base);
    fs::write(staged.join("demo"), b"would clobber the running client").expect("stage file");
    fs::write(staged.join("other.txt"), b"fine").expect("stage file");

    delete_stray_client(&layout, &targets, &current_exe);

    assert!(!staged.join("demo").exists(), "staged client copy must be dropped");
    assert!(staged.join("other.txt").exists(), "unrelated files stay staged");
}

#[cfg(unix)]
#[test]
fn process_guard_reports_matches_without_signalling() {
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("sleep must spawn");
    let pid = child.id() as i32;
    // let the child finish exec so /proc/<pid>/exe is stable
    std::thread::sleep(std::time::Duration::from_millis(100));
    let exe = fs::read_link(format!("/proc/{pid}/exe")).expect("child exe must resolve");

    let err = ensure_not_running(&[exe]).expect_err("a live match must fail the check");
    assert!(err.to_string().contains(&format!("pid {pid}")));
    assert!(
        child.try_wait().expect("try_wait").is_none(),
        "the guard must not signal the matched process"
    );

    assert!(ensure_not_running(&["/nonexistent/never-running".into()]).is_ok());

    child.kill().expect("kill child");
    child.wait().expect("reap child");
}

#[test]
fn resume_after_client_update_requests_a_fresh_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ctx, _targets) = demo_context(dir.path());

    let handoff_path = dir.path().join("handoff.bin");
    SelfUpdateHandoff {
        state_path: ctx.state_path.clone(),
        catalog_path: ctx.catalog_path.clone(),
        client_catalog_path: None,
        base_dir: ctx.targets.base().to_path_buf(),
        scratch_dir: ctx.layout.root().to_path_buf(),
        current_exe: ctx.current_exe.clone(),
        will_self_update: true,
        needs_elevation: false,
        catalog_override: Some("https://mirror.test/catalog.toml".to_string()),
    }
    .write(&handoff_path)
    .expect("handoff must write");

    let mut store = FsRegistryStore::new(dir.path().join("registry"));
    let mut sequencer = UpdateSequencer::new(
        ctx,
        &mut store,
        &NoopOptimizer,
        &FsShellOps,
        CancelFlag::new(),
    );
    let outcome = sequencer
        .resume(&handoff_path, &NullProgress)
        .expect("resume must succeed");
    assert_eq!(
        outcome,
        UpdateOutcome::RestartUpdate {
            catalog_override: Some("https://mirror.test/catalog.toml".to_string()),
        }
    );
    assert!(!handoff_path.exists(), "the handoff must be consumed");
}

#[cfg(unix)]
#[test]
fn find_new_client_wants_exactly_one_executable() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let staged = dir.path().join("base");
    fs::create_dir_all(&staged).expect("staged dir");

    fs::write(staged.join("readme.txt"), b"docs").expect("plain file");
    let client = staged.join("demo");
    fs::write(&client, b"#!/bin/sh\n").expect("client file");
    fs::set_permissions(&client, fs::Permissions::from_mode(0o755)).expect("exec bit");

    let found = find_new_client(None, &staged).expect("sole executable wins");
    assert_eq!(found, client);

    let rival = staged.join("helper");
    fs::write(&rival, b"#!/bin/sh\n").expect("rival file");
    fs::set_permissions(&rival, fs::Permissions::from_mode(0o755)).expect("exec bit");

    let err = find_new_client(None, &staged).expect_err("ambiguous must fail");
    assert!(matches!(err, UpdateError::SelfClientMissing { .. }));
}

#[test]
fn privilege_is_required_for_system_files_and_machine_hives() {
    let mut manifest = UpdateManifest::default();
    assert!(!requires_privilege(&manifest));

    manifest.registry.push(value_op("Software/App", "V", "x"));
    assert!(!requires_privilege(&manifest));

    manifest.registry[0].hive = RegHive::LocalMachine;
    assert!(requires_privilege(&manifest));

    let mut manifest = UpdateManifest::default();
    manifest.files.push(replift_core::FileOperation {
        path: "system/driver.dll".to_string(),
        delta: None,
        target_crc32: None,
        delete: false,
        execute: None,
        managed_assembly: false,
    });
    assert!(requires_privilege(&manifest));
}

#[test]
fn command_text_parses_refresh_icons() {
    assert_eq!(
        parse_command_text("$refreshicons()"),
        vec![PostCommand::RefreshIcons]
    );
    assert_eq!(
        parse_command_text("before $RefreshIcons() after $unknown()"),
        vec![PostCommand::RefreshIcons]
    );
    assert!(parse_command_text("no commands here").is_empty());
}

#[test]
fn uninstall_data_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("uninstall.dat");

    let mut data = UninstallData::default();
    data.files.push(UninstallFile {
        path: "base/app.exe".to_string(),
        deoptimize: true,
    });
    data.files.push(UninstallFile {
        path: "base/app.cfg".to_string(),
        deoptimize: false,
    });
    data.folders.push("base/data".to_string());
    data.registry.push(RegistryOperation {
        op: RegOpKind::DeleteValue,
        hive: RegHive::CurrentUser,
        key: "Software/App".to_string(),
        value_name: Some("InstallDir".to_string()),
        kind: None,
        data: Vec::new(),
    });

    data.store(&path).expect("store must succeed");
    let loaded = UninstallData::load(&path).expect("load must succeed").expect("present");
    assert_eq!(loaded, data);

    // merging the same update twice must not duplicate records
    let mut merged = loaded.clone();
    merged.merge(data.clone());
    assert_eq!(merged, data);
}

#[test]
fn patch_failure_reports_checksum_mismatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");

    let base = targets.base().to_path_buf();
    fs::create_dir_all(&base).expect("target tree");
    fs::write(base.join("lib.dll"), b"original library").expect("seed file");

    let delta = replift_core::encode_delta(b"original library", b"patched library");
    let delta_path = layout.patches_dir().join("lib.dll.delta");
    fs::create_dir_all(layout.patches_dir()).expect("patches dir");
    fs::write(&delta_path, delta).expect("delta file");

    let manifest = UpdateManifest::from_toml_str(
        r#"
[[files]]
path = "base/lib.dll"
delta = "temp/patches/lib.dll.delta"
target_crc32 = 1
"#,
    )
    .expect("manifest should parse");

    let cancel = CancelFlag::new();
    let err = apply_patches(&manifest, &targets, &layout, &cancel, &NullProgress)
        .expect_err("bogus checksum must fail");
    assert!(matches!(err, UpdateError::PatchChecksum { .. }));
    assert!(err.is_patch_failure());
}

#[test]
fn patch_fails_when_the_original_is_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let targets = InstallTargets::rooted_under(&dir.path().join("install"));
    let layout = ScratchLayout::new(dir.path().join("scratch"));
    layout.ensure_dirs().expect("scratch dirs");
    fs::create_dir_all(targets.base()).expect("target tree");

    fs::create_dir_all(layout.patches_dir()).expect("patches dir");
    fs::write(layout.patches_dir().join("lib.dll.delta"), b"whatever").expect("delta file");

    let manifest = UpdateManifest::from_toml_str(
        r#"
[[files]]
path = "base/lib.dll"
delta = "temp/patches/lib.dll.delta"
target_crc32 = 1
"#,
    )
    .expect("manifest should parse");

    let cancel = CancelFlag::new();
    let err = apply_patches(&manifest, &targets, &layout, &cancel, &NullProgress)
        .expect_err("missing original must fail");
    assert!(matches!(err, UpdateError::PatchSourceMissing { .. }));
}

fn demo_context(dir: &Path) -> (UpdateContext, InstallTargets) {
    let targets = InstallTargets::rooted_under(&dir.join("install"));
    let ctx = UpdateContext {
        app_name: "demo".to_string(),
        new_version: Version::new(2, 0, 0),
        layout: ScratchLayout::new(dir.join("scratch")),
        targets: targets.clone(),
        state_path: dir.join("state").join("client.state"),
        uninstall_data_path: dir.join("state").join("uninstall.dat"),
        catalog_path: dir.join("catalog.toml"),
        current_exe: dir.join("demo-client"),
    };
    (ctx, targets)
}

#[test]
fn full_update_installs_patches_and_commits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ctx, targets) = demo_context(dir.path());

    // installed v1: lib.dll will be delta-patched, app.exe is new
    let base = targets.base().to_path_buf();
    fs::create_dir_all(&base).expect("target tree");
    let lib_v1: Vec<u8> = (0u32..30_000).map(|i| (i % 240) as u8).collect();
    fs::write(base.join("lib.dll"), &lib_v1).expect("seed file");

    let mut lib_v2 = lib_v1.clone();
    lib_v2.extend_from_slice(b"v2 additions");
    let delta = replift_core::encode_delta(&lib_v1, &lib_v2);

    let manifest_toml = format!(
        r#"
[[files]]
path = "base/app.exe"

[[files]]
path = "base/lib.dll"
delta = "temp/patches/lib.dll.delta"
target_crc32 = {}

[[registry]]
op = "create_value"
hive = "current_user"
key = "Software/Demo"
value_name = "InstallDir"
kind = "string"
data = ["%basedir%"]
"#,
        crc32_of(&lib_v2)
    );

    build_archive(
        &ctx.layout.archive_path(),
        &[
            ("update.toml", manifest_toml.as_bytes()),
            ("base/app.exe", b"shiny new app".as_slice()),
            ("temp/patches/lib.dll.delta", delta.as_slice()),
        ],
    );

    let mut store = FsRegistryStore::new(dir.path().join("registry"));
    let scratch_root = ctx.layout.root().to_path_buf();
    let state_path = ctx.state_path.clone();
    let uninstall_path = ctx.uninstall_data_path.clone();

    let mut sequencer = UpdateSequencer::new(
        ctx,
        &mut store,
        &NoopOptimizer,
        &FsShellOps,
        CancelFlag::new(),
    );
    let outcome = sequencer.run(&NullProgress).expect("update must succeed");
    assert_eq!(outcome, UpdateOutcome::Completed);

    assert_eq!(
        fs::read(base.join("app.exe")).expect("new file"),
        b"shiny new app"
    );
    assert_eq!(fs::read(base.join("lib.dll")).expect("patched file"), lib_v2);
    assert_eq!(
        store
            .get_value(RegHive::CurrentUser, "Software/Demo", "InstallDir")
            .expect("get")
            .expect("present")
            .data,
        vec![base.display().to_string()]
    );

    let state = ClientState::load(&state_path)
        .expect("state must load")
        .expect("state must exist");
    assert_eq!(state.version, Version::new(2, 0, 0));
    assert!(!scratch_root.exists(), "scratch must be purged on commit");

    // uninstall removes what the update recorded
    let mut sink_store = store;
    run_uninstall(
        &uninstall_path,
        &state_path,
        &targets,
        &scratch_root,
        &mut sink_store,
        &NoopOptimizer,
        &NullProgress,
    )
    .expect("uninstall must succeed");
    assert!(!base.join("app.exe").exists());
    assert!(!base.join("lib.dll").exists());
    assert!(sink_store
        .get_value(RegHive::CurrentUser, "Software/Demo", "InstallDir")
        .expect("get")
        .is_none());
    assert!(!state_path.exists());
}

#[test]
fn product_patch_failure_preserves_archive_and_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ctx, targets) = demo_context(dir.path());

    let base = targets.base().to_path_buf();
    fs::create_dir_all(&base).expect("target tree");
    fs::write(base.join("lib.dll"), b"installed v1").expect("seed file");

    let delta = replift_core::encode_delta(b"installed v1", b"installed v2");
    let manifest_toml = r#"
[[files]]
path = "base/lib.dll"
delta = "temp/patches/lib.dll.delta"
target_crc32 = 12345
"#;

    build_archive(
        &ctx.layout.archive_path(),
        &[
            ("update.toml", manifest_toml.as_bytes()),
            ("temp/patches/lib.dll.delta", delta.as_slice()),
        ],
    );

    let layout = ctx.layout.clone();
    let mut store = FsRegistryStore::new(dir.path().join("registry"));
    let mut sequencer = UpdateSequencer::new(
        ctx,
        &mut store,
        &NoopOptimizer,
        &FsShellOps,
        CancelFlag::new(),
    );
    let err = sequencer
        .run(&NullProgress)
        .expect_err("checksum mismatch must fail the run");
    assert!(err.is_patch_failure());

    // targets untouched, retry material kept, staging gutted
    assert_eq!(fs::read(base.join("lib.dll")).expect("still v1"), b"installed v1");
    assert!(layout.archive_path().exists(), "archive must survive");
    assert!(layout.manifest_path().exists(), "manifest must survive");
    assert!(
        !layout.class_dir(replift_core::TargetClass::Base).exists(),
        "staging must be gutted"
    );
}

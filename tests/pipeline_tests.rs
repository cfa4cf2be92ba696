//! End-to-end pipeline tests against the fake host.
//!
//! Every test drives `Pipeline::execute` with already cached inputs. The fake
//! host tracks mounts, so the tests can check that nothing stays bound after
//! a failure anywhere in the pipeline.

mod helpers;

use std::fs;

use serial_test::serial;

use helpers::{assert_file_contains, host, preseed_free_space, TestEnv, STATION};
use stationiso::backup::BackupStore;
use stationiso::build::BuildOptions;
use stationiso::host::fake::{FailPoint, FakeHost};
use stationiso::interrupt::Interrupt;
use stationiso::manifest::{BuildManifest, BuildResult, Outcome};
use stationiso::pipeline::Pipeline;
use stationiso::preseed::{parse_preseed, PRESEED_REL};
use stationiso::BuildError;

const STAGES: &[&str] = &[
    "capture-rolling",
    "plan",
    "extract",
    "enter-chroot",
    "installer",
    "customize",
    "preseed",
    "leave-chroot",
    "unmount",
    "repack",
];

fn run_with(env: &TestEnv, host: &FakeHost) -> (Result<stationiso::pipeline::BuildOutput, BuildError>, BuildManifest) {
    let mut ctx = env.context();
    let result = Pipeline::new(host).execute(&mut ctx, &env.inputs());
    (result, ctx.manifest)
}

fn assert_unwound(host: &FakeHost) {
    assert!(
        host.active_mounts().is_empty(),
        "mounts left behind: {:?}",
        host.active_mounts()
    );
}

// =============================================================================
// Happy path
// =============================================================================

#[test]
#[serial]
fn test_full_build_produces_image_and_ordered_manifest() {
    let env = TestEnv::new();
    let host = host();

    let (result, manifest) = run_with(&env, &host);
    let output = result.unwrap();

    assert_unwound(&host);
    assert_eq!(host.peak_mounts(), 5);
    assert!(output.image.iso.is_file());
    assert_eq!(
        output.image.iso.file_name().unwrap(),
        "stationiso-kt7run-22.04.5.iso"
    );

    let stages: Vec<&str> = manifest.stages().map(|e| e.name.as_str()).collect();
    assert_eq!(stages, STAGES);
    assert!(manifest.stages().all(|e| e.outcome == Outcome::Applied));

    let units: Vec<&str> = manifest.units().map(|e| e.name.as_str()).collect();
    assert_eq!(units.first(), Some(&"base-overlay"));
    assert_eq!(units.last(), Some(&"license-import"));

    // units are recorded between the customize stage's neighbours
    let seq = |name: &str| manifest.entry(name).unwrap().seq;
    assert!(seq("installer") < seq("base-overlay"));
    assert!(seq("license-import") < seq("customize"));

    // the manifest on disk matches what the context holds
    let saved = BuildManifest::load(&env.config.manifest_file()).unwrap();
    assert_eq!(saved.entries.len(), manifest.entries.len());
    assert!(matches!(saved.result, Some(BuildResult::Succeeded { .. })));
}

#[test]
#[serial]
fn test_preseed_in_image_matches_station_and_boot_entries() {
    let env = TestEnv::new();
    let host = host();

    let (result, _) = run_with(&env, &host);
    result.unwrap();

    let seed = fs::read_to_string(env.iso_root().join(PRESEED_REL)).unwrap();
    let answers = parse_preseed(&seed);
    assert_eq!(answers["passwd/username"], "operator");
    assert_eq!(answers["passwd/user-fullname"], "Station Operator");
    assert_eq!(answers["netcfg/get_hostname"], "kt7run");
    assert_eq!(answers["time/zone"], "America/Denver");
    assert_eq!(answers["partman-auto/disk"], "/dev/sda");
    assert_eq!(answers["partman-auto/init_automatically_partition"], "biggest_free");

    for cfg in ["boot/grub/grub.cfg", "isolinux/txt.cfg"] {
        let path = env.iso_root().join(cfg);
        assert_file_contains(&path, "preseed/file=/cdrom/preseed/stationiso.seed");
        assert_file_contains(&path, "netcfg/get_hostname=kt7run");
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("ubuntu.seed"), "{} still points at the stock seed", cfg);
    }

    // md5sum.txt was regenerated after the preseed landed
    assert_file_contains(&env.iso_root().join("md5sum.txt"), "./preseed/stationiso.seed");
}

#[test]
#[serial]
fn test_golden_then_rolling_last_applied_wins() {
    let prev = tempfile::TempDir::new().unwrap();
    let station = format!(
        "{}{}\n[backup]\nprevious_state = \"{}\"\npaths = [\".config/js8call\", \".local/share/WSJT-X\"]\n",
        STATION,
        preseed_free_space(),
        prev.path().display()
    );
    let env = TestEnv::with_station(&station);

    let reference = env.path("reference-home");
    fs::create_dir_all(reference.join(".config/js8call")).unwrap();
    fs::create_dir_all(reference.join(".local/share/WSJT-X")).unwrap();
    fs::write(reference.join(".config/js8call/js8call.ini"), "golden").unwrap();
    fs::write(reference.join(".local/share/WSJT-X/golden-only.txt"), "keep").unwrap();
    let store = BackupStore::new(env.config.backup_dir());
    store
        .create_golden(
            &reference,
            &[".config/js8call".to_string(), ".local/share/WSJT-X".to_string()],
        )
        .unwrap();

    fs::create_dir_all(prev.path().join(".config/js8call")).unwrap();
    fs::write(prev.path().join(".config/js8call/js8call.ini"), "rolling").unwrap();

    let host = host();
    let (result, manifest) = run_with(&env, &host);
    result.unwrap();

    let skel = env.tree().join("etc/skel");
    assert_eq!(
        fs::read_to_string(skel.join(".config/js8call/js8call.ini")).unwrap(),
        "rolling"
    );
    assert_eq!(
        fs::read_to_string(skel.join(".local/share/WSJT-X/golden-only.txt")).unwrap(),
        "keep"
    );
    let golden = manifest.entry("golden-master-restore").unwrap().seq;
    let rolling = manifest.entry("rolling-restore").unwrap().seq;
    assert!(golden < rolling);
}

#[test]
#[serial]
fn test_deferrable_unit_failure_degrades_but_still_builds() {
    let env = TestEnv::new();
    let script = env.script("callsign-banner.sh", "exit 1");
    let station = format!(
        "{}{}\n[[unit]]\nname = \"callsign-banner\"\nscript = \"{}\"\nphase = \"extras\"\npolicy = \"deferrable\"\nwrites = [\"usr/share/stationiso/banner\"]\n",
        STATION,
        preseed_free_space(),
        script.display()
    );
    fs::write(&env.config.station_file, station).unwrap();
    let host = host();

    let (result, manifest) = run_with(&env, &host);
    let output = result.unwrap();

    assert_eq!(output.summary.warnings, vec!["callsign-banner".to_string()]);
    assert_eq!(manifest.entry("callsign-banner").unwrap().outcome, Outcome::Failed);
    assert!(matches!(
        manifest.result,
        Some(BuildResult::Degraded { warnings: 1, .. })
    ));
    assert_unwound(&host);
}

// =============================================================================
// Failure unwinding
// =============================================================================

fn assert_failed_clean(env: &TestEnv, host: &FakeHost, expected_code: u8) -> BuildManifest {
    let (result, manifest) = run_with(env, host);
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), expected_code, "unexpected error: {}", err);
    assert_unwound(host);
    assert!(!host.called("mksquashfs"), "repack must not run after a failure");
    match &manifest.result {
        Some(BuildResult::Failed { kind, .. }) => assert_eq!(kind, err.kind()),
        other => panic!("expected a failed result, got {:?}", other),
    }
    manifest
}

#[test]
#[serial]
fn test_extract_failure_leaves_nothing_mounted() {
    let env = TestEnv::new();
    let host = host();
    host.fail_at(FailPoint::ExtractIso);

    let manifest = assert_failed_clean(&env, &host, 5);
    assert_eq!(manifest.entry("extract").unwrap().outcome, Outcome::Failed);
    assert!(manifest.entry("enter-chroot").is_none());
    assert!(!host.called("mount"));
}

#[test]
#[serial]
fn test_partial_bind_failure_unwinds_earlier_mounts() {
    let env = TestEnv::new();
    let host = host();
    host.fail_at(FailPoint::Mount("sys"));

    let manifest = assert_failed_clean(&env, &host, 5);
    assert!(host.called("mount proc"));
    assert_eq!(manifest.entry("enter-chroot").unwrap().outcome, Outcome::Failed);
    assert_eq!(manifest.entry("unmount").unwrap().outcome, Outcome::Applied);
}

#[test]
#[serial]
fn test_failed_entry_probe_unwinds() {
    let env = TestEnv::new();
    let host = host();
    host.fail_at(FailPoint::ChrootProbe);

    assert_failed_clean(&env, &host, 5);
    assert_eq!(host.peak_mounts(), 5);
}

#[test]
#[serial]
fn test_installer_failure_unwinds_and_skips_customization() {
    let env = TestEnv::new();
    let host = host();
    host.fail_at(FailPoint::Installer);

    let manifest = assert_failed_clean(&env, &host, 6);
    assert_eq!(manifest.units().count(), 0);
    assert_eq!(manifest.entry("unmount").unwrap().outcome, Outcome::Applied);
}

#[test]
#[serial]
fn test_core_unit_failure_unwinds_and_stops() {
    let env = TestEnv::new();
    let script = env.script("rig-control.sh", "exit 1");
    let station = format!(
        "{}{}\n[[unit]]\nname = \"rig-control\"\nscript = \"{}\"\nphase = \"final-config\"\nwrites = [\"etc/rigctld.conf\"]\n",
        STATION,
        preseed_free_space(),
        script.display()
    );
    fs::write(&env.config.station_file, station).unwrap();
    let host = host();

    let manifest = assert_failed_clean(&env, &host, 7);
    assert_eq!(manifest.entry("rig-control").unwrap().outcome, Outcome::Failed);
    assert!(manifest.entry("documentation").is_none());
    assert!(manifest.entry("preseed").is_none());
}

#[test]
#[serial]
fn test_auto_detect_with_no_safe_target_fails_instead_of_wiping() {
    let env = TestEnv::new();
    let layout = env.path("layout.json");
    fs::write(
        &layout,
        r#"{"blockdevices":[{"name":"sda","size":107374182400,"type":"disk",
            "children":[{"name":"sda1","size":107374182400,"type":"part","fstype":"ntfs","label":"Windows"}]}]}"#,
    )
    .unwrap();
    let preseed = preseed_free_space()
        .replace("partition = \"free-space\"", "partition = \"auto-detect\"")
        .replace(
            "target_disk = \"/dev/sda\"",
            &format!("target_disk = \"/dev/sda\"\nlayout_file = \"{}\"", layout.display()),
        );
    fs::write(&env.config.station_file, format!("{}{}", STATION, preseed)).unwrap();
    let host = host();

    let manifest = assert_failed_clean(&env, &host, 8);
    assert_eq!(manifest.entry("preseed").unwrap().outcome, Outcome::Failed);
    assert!(!env.iso_root().join(PRESEED_REL).exists());
}

#[test]
#[serial]
fn test_leaked_mount_fails_build_instead_of_repacking() {
    let env = TestEnv::new();
    let host = host();
    host.fail_at(FailPoint::Unmount("proc"));

    let (result, manifest) = run_with(&env, &host);
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 5);
    assert!(!host.called("mksquashfs"));
    assert!(!host.called("mkiso"));
    assert!(manifest.entry("repack").is_none());
}

#[test]
#[serial]
fn test_cancelled_build_records_cancellation() {
    let env = TestEnv::new();
    let host = host();
    let interrupt = Interrupt::new();
    interrupt.trigger(libc::SIGINT);

    let mut ctx = env.context_with(BuildOptions::default(), interrupt);
    let err = Pipeline::new(&host)
        .execute(&mut ctx, &env.inputs())
        .unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert!(matches!(ctx.manifest.result, Some(BuildResult::Cancelled)));
    assert!(!host.called("extract_iso"));
    assert_unwound(&host);
}

#[test]
#[serial]
fn test_interrupt_inside_chroot_unwinds_before_customizing() {
    let env = TestEnv::new();
    let interrupt = Interrupt::new();
    let host = host().interrupt_during_installer(interrupt.clone());

    let mut ctx = env.context_with(BuildOptions::default(), interrupt);
    let err = Pipeline::new(&host)
        .execute(&mut ctx, &env.inputs())
        .unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    assert!(matches!(ctx.manifest.result, Some(BuildResult::Cancelled)));
    assert_eq!(host.peak_mounts(), 5);
    assert_unwound(&host);

    let manifest = &ctx.manifest;
    assert_eq!(manifest.entry("installer").unwrap().outcome, Outcome::Applied);
    assert_eq!(manifest.entry("customize").unwrap().outcome, Outcome::Skipped);
    assert_eq!(manifest.entry("unmount").unwrap().outcome, Outcome::Applied);
    assert_eq!(manifest.units().count(), 0);
    assert!(manifest.entry("repack").is_none());
    assert!(!host.called("mksquashfs"));
}

#[test]
#[serial]
fn test_second_build_reuses_marked_tree() {
    let env = TestEnv::new();
    let host = host();
    let (first, _) = run_with(&env, &host);
    first.unwrap();

    // a successful build leaves the tree marked reusable
    let (second, _) = run_with(&env, &host);
    second.unwrap();
    assert_unwound(&host);
}

//! End-to-end pipeline runs against an in-memory device.

use std::path::{Path, PathBuf};

use qpatch_adb::{AdbError, Device, MockDeviceLink};
use qpatch_core::testing::{build_apk, naive_patch, read_zip_entries, EventLog, RecordingSigner};
use qpatch_core::{
    PatchRegistry, PatcherError, Pipeline, PipelineConfig, Sha256Digest, Stage, StageEvent,
    TrustedSet,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PACKAGE: &str = "com.example.game";
const VERSION_CODE: u64 = 4987566;
const SERIAL: &str = "1WMHH000000000";
const LIBRARY: &[u8] = b"\x7fELF stock native library build";
const PATCHED_LIBRARY: &[u8] = b"\x7fELF patched native library build, longer";
const DATA_BLOB: &[u8] = b"OBB payload bytes";

struct Fixture {
    _dir: TempDir,
    config: PipelineConfig,
    original: Vec<u8>,
    patches: PatchRegistry,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let archive = root.join("game.apk");
        build_apk(
            &archive,
            &[
                ("AndroidManifest.xml", b"<manifest/>" as &[u8]),
                ("classes.dex", b"dex\n035"),
                ("resources.arsc", b"arsc table"),
                ("lib/arm64-v8a/libpnsovr.so", LIBRARY),
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0"),
            ],
        )
        .unwrap();
        let original = std::fs::read(&archive).unwrap();

        let data_blob = root.join(format!("main.{VERSION_CODE}.{PACKAGE}.obb"));
        std::fs::write(&data_blob, DATA_BLOB).unwrap();

        let mut config = PipelineConfig::default();
        config.package.name = PACKAGE.to_string();
        config.package.archive = archive;
        config.package.data_blob = data_blob;
        config.package.remote_data_dir = format!("/sdcard/Android/obb/{PACKAGE}");
        config.trust.archive = TrustedSet::new(vec![Sha256Digest::of(&original)]);
        config.trust.data_blob = TrustedSet::new(vec![Sha256Digest::of(DATA_BLOB)]);
        config.device.poll_interval_ms = 10;
        config.device.max_polls = Some(3);
        config.workspace.dir = root.join("temp");
        config.workspace.patched_archive = root.join("patched.apk");

        let mut patches = PatchRegistry::new();
        patches.register_bytes(
            Sha256Digest::of(LIBRARY),
            naive_patch(LIBRARY, PATCHED_LIBRARY).unwrap(),
            Some(Sha256Digest::of(PATCHED_LIBRARY)),
        );

        Self {
            _dir: dir,
            config,
            original,
            patches,
        }
    }

    fn link(&self) -> MockDeviceLink {
        MockDeviceLink::new()
            .with_devices(vec![
                Device::new("PHONE01", "panther"),
                Device::new(SERIAL, "hollywood"),
            ])
            .with_package(PACKAGE, VERSION_CODE, self.original.clone())
            .installs_as(PACKAGE, VERSION_CODE)
    }

    fn pipeline(
        &self,
        link: MockDeviceLink,
        signer: &RecordingSigner,
        events: &EventLog,
    ) -> Pipeline<MockDeviceLink> {
        Pipeline::new(self.config.clone(), link, Box::new(signer.clone()))
            .with_patches(self.patches.clone())
            .with_observer(events.observer())
    }

    fn patched_archive(&self) -> PathBuf {
        self.config.workspace.patched_archive.clone()
    }
}

fn entries_of(bytes: &[u8], scratch: &Path) -> std::collections::BTreeMap<String, Vec<u8>> {
    let path = scratch.join("installed.apk");
    std::fs::write(&path, bytes).unwrap();
    read_zip_entries(&path).unwrap()
}

fn device_was_modified(link: &MockDeviceLink) -> bool {
    link.commands()
        .iter()
        .any(|c| {
            c.starts_with("pm uninstall") || c.starts_with("pm install") || c.starts_with("mkdir")
        })
}

#[tokio::test]
async fn integration_full_deployment() {
    let fixture = Fixture::new();
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(fixture.link(), &signer, &events);

    let report = pipeline.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.device.serial, SERIAL);
    assert_eq!(report.stages, Stage::ALL.to_vec());
    assert_eq!(report.library_source, Sha256Digest::of(LIBRARY));
    assert_eq!(report.library_output, Sha256Digest::of(PATCHED_LIBRARY));
    assert!(report.host_value.ends_with(SERIAL));
    assert!(report.replaced_existing);
    assert!(report.patched_archive.is_none());
    assert!(!fixture.patched_archive().exists());
    assert_eq!(signer.signed(), vec![fixture.patched_archive()]);

    let link = pipeline.link();
    let scratch = TempDir::new().unwrap();
    let installed = entries_of(&link.installed_archive(PACKAGE).unwrap(), scratch.path());
    assert_eq!(installed["lib/arm64-v8a/libpnsovr.so"], PATCHED_LIBRARY);
    assert!(!installed.contains_key("META-INF/MANIFEST.MF"));
    let document: serde_json::Value =
        serde_json::from_slice(&installed["assets/_local/config.json"]).unwrap();
    assert_eq!(document["loginservice_host"], report.host_value.as_str());

    assert_eq!(link.file(&report.data_blob_remote).unwrap(), DATA_BLOB);
    assert!(link.has_dir(&format!("/sdcard/Android/obb/{PACKAGE}")));
    assert!(link.file("/data/local/tmp/patched.apk").is_none());

    let events = events.events();
    assert_eq!(events.first(), Some(&StageEvent::Started(Stage::ConnectServer)));
    assert_eq!(events.last(), Some(&StageEvent::Completed(Stage::Cleanup)));
    assert!(!events.iter().any(|e| matches!(e, StageEvent::Failed(..))));
}

#[tokio::test]
async fn integration_keep_outputs() {
    let mut fixture = Fixture::new();
    fixture.config.workspace.keep_outputs = true;
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(fixture.link(), &signer, &events);

    let report = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.patched_archive, Some(fixture.patched_archive()));

    let entries = read_zip_entries(&fixture.patched_archive()).unwrap();
    assert_eq!(entries["lib/arm64-v8a/libpnsovr.so"], PATCHED_LIBRARY);
}

#[tokio::test]
async fn integration_untrusted_archive_stops_before_device_changes() {
    let mut fixture = Fixture::new();
    fixture.config.trust.archive = TrustedSet::new(vec![Sha256Digest::of(b"another build")]);
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(fixture.link(), &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::VerifyArchive);
    assert!(matches!(failure.source, PatcherError::IntegrityMismatch { .. }));

    let link = pipeline.link();
    assert!(!device_was_modified(link));
    assert!(link.package(PACKAGE).is_some());
    assert!(signer.signed().is_empty());
    assert!(matches!(events.events().last(), Some(StageEvent::Failed(Stage::VerifyArchive, _))));
}

#[tokio::test]
async fn integration_untrusted_data_blob() {
    let fixture = Fixture::new();
    std::fs::write(&fixture.config.package.data_blob, b"tampered payload").unwrap();
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(fixture.link(), &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::VerifyDataBlob);
    assert!(!device_was_modified(pipeline.link()));
}

#[tokio::test]
async fn integration_sign_failure_leaves_device_untouched() {
    let fixture = Fixture::new();
    let signer = RecordingSigner::failing("keystore was tampered with");
    let events = EventLog::default();
    let pipeline = fixture.pipeline(fixture.link(), &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Sign);
    assert!(matches!(failure.source, PatcherError::SignFailed(_)));
    assert!(!device_was_modified(pipeline.link()));
    assert!(!fixture.config.working_tree_dir().exists());
}

#[tokio::test]
async fn integration_repack_failure_removes_working_files() {
    let mut fixture = Fixture::new();
    let output_dir = fixture.config.workspace.dir.join("missing");
    fixture.config.workspace.patched_archive = output_dir.join("patched.apk");
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(fixture.link(), &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Repack);
    assert!(events.events().contains(&StageEvent::Completed(Stage::PatchLibrary)));
    assert!(!fixture.config.working_tree_dir().exists());
    assert!(!output_dir.exists());
    assert!(signer.signed().is_empty());
    assert!(!device_was_modified(pipeline.link()));

    let leftovers: Vec<PathBuf> = std::fs::read_dir(&fixture.config.workspace.dir)
        .map(|entries| entries.map(|entry| entry.unwrap().path()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
}

#[tokio::test]
async fn integration_uninstall_failure_discards_staged_archive() {
    let fixture = Fixture::new();
    let link = fixture
        .link()
        .script_once("pm uninstall", "Failure [DELETE_FAILED_INTERNAL_ERROR]\n");
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Uninstall);

    let link = pipeline.link();
    assert!(link.file("/data/local/tmp/patched.apk").is_none());
    assert!(link.commands().iter().any(|c| c.starts_with("rm -f")));
    assert_eq!(link.installed_archive(PACKAGE).unwrap(), fixture.original);
}

#[tokio::test]
async fn integration_install_failure_restores_original() {
    let fixture = Fixture::new();
    let link = fixture
        .link()
        .script_once("pm install", "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE]\n");
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Install);
    assert!(matches!(failure.source, PatcherError::Protocol(_)));

    let link = pipeline.link();
    assert_eq!(link.installed_archive(PACKAGE).unwrap(), fixture.original);
    assert!(link.file("/data/local/tmp/patched.apk").is_none());
    assert!(link.file("/data/local/tmp/qpatch-restore.apk").is_none());
    assert!(!link.has_dir(&format!("/sdcard/Android/obb/{PACKAGE}")));
}

#[tokio::test]
async fn integration_install_failure_without_rollback() {
    let mut fixture = Fixture::new();
    fixture.config.device.rollback_on_install_failure = false;
    let link = fixture
        .link()
        .script_once("pm install", "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE]\n");
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Install);
    assert!(pipeline.link().package(PACKAGE).is_none());
}

#[tokio::test]
async fn integration_data_blob_push_failure() {
    let fixture = Fixture::new();
    let link = fixture.link().fail_push("/sdcard/", "Read-only file system");
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::PushDataBlob);
    assert!(matches!(
        failure.source,
        PatcherError::Protocol(AdbError::Sync { .. })
    ));
    // The patched archive stays installed.
    let link = pipeline.link();
    assert!(link.installed_archive(PACKAGE).is_some());
    assert_ne!(link.installed_archive(PACKAGE).unwrap(), fixture.original);
    assert!(link.file("/data/local/tmp/patched.apk").is_none());
}

#[tokio::test]
async fn integration_no_supported_device() {
    let fixture = Fixture::new();
    let link = MockDeviceLink::new().with_devices(vec![Device::new("PHONE01", "panther")]);
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::DiscoverDevice);
    assert!(matches!(failure.source, PatcherError::DeviceNotFound { polls: 3 }));
    assert_eq!(pipeline.link().polls(), 3);
}

#[tokio::test]
async fn integration_device_appears_later() {
    let fixture = Fixture::new();
    let link = fixture
        .link()
        .with_devices(vec![])
        .queue_devices(vec![Device::new(SERIAL, "hollywood")]);
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let report = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.device.serial, SERIAL);
    assert_eq!(pipeline.link().polls(), 2);
}

#[tokio::test]
async fn integration_cancelled_discovery() {
    let fixture = Fixture::new();
    let link = MockDeviceLink::new();
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = pipeline.run(&cancel).await.unwrap_err();
    assert_eq!(failure.stage, Stage::DiscoverDevice);
    assert!(matches!(failure.source, PatcherError::DiscoveryCancelled));
}

#[tokio::test]
async fn integration_archive_pulled_from_device() {
    let fixture = Fixture::new();
    std::fs::remove_file(&fixture.config.package.archive).unwrap();
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(fixture.link(), &signer, &events);

    let report = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert!(matches!(
        report.archive.origin,
        qpatch_core::ArtifactOrigin::Device { .. }
    ));
    assert_eq!(std::fs::read(&fixture.config.package.archive).unwrap(), fixture.original);
}

#[tokio::test]
async fn integration_unsupported_installed_version() {
    let fixture = Fixture::new();
    std::fs::remove_file(&fixture.config.package.archive).unwrap();
    let link = MockDeviceLink::new()
        .with_devices(vec![Device::new(SERIAL, "hollywood")])
        .with_package(PACKAGE, VERSION_CODE - 1, fixture.original.clone());
    let signer = RecordingSigner::new();
    let events = EventLog::default();
    let pipeline = fixture.pipeline(link, &signer, &events);

    let failure = pipeline.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::LocateArchive);
    assert!(matches!(
        failure.source,
        PatcherError::UnsupportedSourceVersion { installed, .. } if installed == VERSION_CODE - 1
    ));
}

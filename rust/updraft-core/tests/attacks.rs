//! A hostile mirror: replayed, frozen, mixed, forged, and corrupted data.
//!
//! Every test checks the rejection and that the client's trusted state did
//! not move.

mod common;

use common::{Fixture, PASSPHRASE};
use updraft_core::metadata::{expires_in, MetaFile, Snapshot, Targets, Timestamp};
use updraft_core::{
    init_repository, publish_update, CancelToken, Metadata, NoProgress, RepositoryState, RoleType,
    TufError,
};

fn init_with_app(fx: &Fixture) {
    let v1 = fx.artifact("app.exe", b"first release");
    drop(init_repository(fx.repo_config(), &[v1], PASSPHRASE).unwrap());
}

fn publish(fx: &Fixture, body: &[u8]) {
    let mut state = RepositoryState::load(fx.repo_config(), PASSPHRASE).unwrap();
    publish_update(&mut state, &[fx.artifact("app.exe", body)]).unwrap();
}

#[test]
fn test_replayed_timestamp_is_rollback() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let old_timestamp = std::fs::read(fx.metadata_dir().join("timestamp.json")).unwrap();

    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    publish(&fx, b"second release");
    updater.refresh().unwrap();
    assert_eq!(fx.client_version(&updater, "timestamp.json"), 2);

    std::fs::write(fx.metadata_dir().join("timestamp.json"), old_timestamp).unwrap();
    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Timestamp,
                current: 2,
                received: 1
            }
        ),
        "{:?}",
        err
    );
    assert!(err.is_security_failure());
    assert_eq!(fx.client_version(&updater, "timestamp.json"), 2);
}

#[test]
fn test_frozen_metadata_is_rejected() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    // A validly signed cycle that has already expired.
    let mut config = fx.repo_config();
    config.expiry_days = -1;
    let mut state = RepositoryState::load(config, PASSPHRASE).unwrap();
    publish_update(&mut state, &[]).unwrap();
    drop(state);

    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::MetadataExpired {
                role: RoleType::Timestamp,
                ..
            }
        ),
        "{:?}",
        err
    );
    assert_eq!(fx.client_version(&updater, "timestamp.json"), 1);
}

#[test]
fn test_tampered_timestamp_fails_threshold() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();

    let path = fx.metadata_dir().join("timestamp.json");
    let mut value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    value["signed"]["version"] = serde_json::json!(99);
    std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::ThresholdNotMet {
                role: RoleType::Timestamp,
                required: 1,
                valid: 0
            }
        ),
        "{:?}",
        err
    );
    assert!(!updater.metadata_dir().join("timestamp.json").exists());
}

#[test]
fn test_swapped_snapshot_is_inconsistent() {
    let fx = Fixture::new();
    init_with_app(&fx);
    publish(&fx, b"second release");
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();

    // Serve the old snapshot under the new name.
    let md = fx.metadata_dir();
    std::fs::copy(md.join("1.snapshot.json"), md.join("2.snapshot.json")).unwrap();

    let err = updater.refresh().unwrap_err();
    assert!(matches!(err, TufError::Consistency(_)), "{:?}", err);
    assert!(!updater.metadata_dir().join("timestamp.json").exists());
}

#[test]
fn test_targets_version_must_match_snapshot_pin() {
    let fx = Fixture::new();
    init_with_app(&fx);
    publish(&fx, b"second release");

    // Correctly signed snapshot/timestamp pinning targets version 3, while
    // 3.targets.json actually holds version 2. No hashes are pinned, so
    // only the version check can catch it.
    let md = fx.metadata_dir();
    std::fs::copy(md.join("2.targets.json"), md.join("3.targets.json")).unwrap();

    let mut snapshot: Metadata<Snapshot> = fx.read_repo("2.snapshot.json");
    snapshot.signed.version = 3;
    snapshot
        .signed
        .meta
        .insert("targets.json".to_string(), MetaFile::new(3));
    snapshot.sign(&fx.key(RoleType::Snapshot)).unwrap();
    let snapshot_bytes = fx.write_repo("3.snapshot.json", &snapshot);

    let mut timestamp: Metadata<Timestamp> = fx.read_repo("timestamp.json");
    timestamp.signed.version = 3;
    timestamp
        .signed
        .set_snapshot_meta(MetaFile::describing(3, &snapshot_bytes));
    timestamp.sign(&fx.key(RoleType::Timestamp)).unwrap();
    fx.write_repo("timestamp.json", &timestamp);

    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    let err = updater.refresh().unwrap_err();
    assert!(
        err.to_string()
            .contains("snapshot pins targets version 3, got 2"),
        "{}",
        err
    );
    assert!(matches!(err, TufError::Consistency(_)));
}

#[test]
fn test_targets_signed_by_wrong_role_key() {
    let fx = Fixture::new();
    init_with_app(&fx);

    // Re-sign targets with the snapshot key and re-pin it honestly.
    let mut targets: Metadata<Targets> = fx.read_repo("1.targets.json");
    targets.signed.version = 2;
    targets.signed.expires = expires_in(7);
    targets.clear_signatures();
    targets.sign(&fx.key(RoleType::Snapshot)).unwrap();
    let targets_bytes = fx.write_repo("2.targets.json", &targets);

    let mut snapshot: Metadata<Snapshot> = fx.read_repo("1.snapshot.json");
    snapshot.signed.version = 2;
    snapshot.signed.meta.insert(
        "targets.json".to_string(),
        MetaFile::describing(2, &targets_bytes),
    );
    snapshot.clear_signatures();
    snapshot.sign(&fx.key(RoleType::Snapshot)).unwrap();
    let snapshot_bytes = fx.write_repo("2.snapshot.json", &snapshot);

    let mut timestamp: Metadata<Timestamp> = fx.read_repo("timestamp.json");
    timestamp.signed.version = 2;
    timestamp
        .signed
        .set_snapshot_meta(MetaFile::describing(2, &snapshot_bytes));
    timestamp.clear_signatures();
    timestamp.sign(&fx.key(RoleType::Timestamp)).unwrap();
    fx.write_repo("timestamp.json", &timestamp);

    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::ThresholdNotMet {
                role: RoleType::Targets,
                ..
            }
        ),
        "{:?}",
        err
    );
}

#[test]
fn test_root_rotation_without_old_keys_is_rejected() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    // An attacker-made version 2 root, self-signed by a key the old root
    // never authorized.
    let mut root: Metadata<updraft_core::metadata::Root> = fx.read_repo("1.root.json");
    let attacker = updraft_core::KeyPair::generate();
    let old_root_key = fx.key(RoleType::Root);
    root.signed
        .revoke_key(RoleType::Root, old_root_key.key_id())
        .unwrap();
    root.signed
        .add_key(RoleType::Root, attacker.public_key())
        .unwrap();
    root.signed.version = 2;
    root.clear_signatures();
    root.sign(&attacker).unwrap();
    fx.write_repo("2.root.json", &root);

    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::ThresholdNotMet {
                role: RoleType::Root,
                ..
            }
        ),
        "{:?}",
        err
    );
    assert_eq!(fx.client_version(&updater, "root.json"), 1);
}

#[test]
fn test_root_with_wrong_version_number_is_rejected() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();

    let mut root: Metadata<updraft_core::metadata::Root> = fx.read_repo("1.root.json");
    root.signed.version = 5;
    root.clear_signatures();
    root.sign(&fx.key(RoleType::Root)).unwrap();
    fx.write_repo("2.root.json", &root);

    let err = updater.refresh().unwrap_err();
    assert!(matches!(err, TufError::Consistency(_)), "{:?}", err);
}

#[test]
fn test_corrupted_artifact_leaves_no_cache() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    // Same length, different bytes.
    std::fs::write(fx.repo_dir().join("app.exe"), b"FIRST RELEASE").unwrap();
    let info = updater.get_target_info("app.exe").unwrap();
    let err = updater
        .download_target(&info, &mut NoProgress, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, TufError::Integrity { .. }), "{:?}", err);

    assert!(updater.find_cached(&info).is_none());
    let leftovers = std::fs::read_dir(fx.download_dir()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_oversized_artifact_is_cut_off() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    std::fs::write(
        fx.repo_dir().join("app.exe"),
        b"first release, plus an endless tail of attacker bytes",
    )
    .unwrap();
    let info = updater.get_target_info("app.exe").unwrap();
    let err = updater
        .download_target(&info, &mut NoProgress, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, TufError::Integrity { .. }));
    assert!(!updater.cache_path(&info).exists());
}

#[test]
fn test_cancelled_download_leaves_no_cache() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let info = updater.get_target_info("app.exe").unwrap();
    let err = updater
        .download_target(&info, &mut NoProgress, &cancel)
        .unwrap_err();
    assert!(matches!(err, TufError::Cancelled));
    assert!(!err.is_security_failure());
    assert!(!updater.cache_path(&info).exists());
}

#[test]
fn test_timestamp_pinning_older_snapshot_is_rollback() {
    let fx = Fixture::new();
    init_with_app(&fx);
    publish(&fx, b"second release");
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    // A newer, validly signed timestamp that points back at snapshot 1.
    let old_snapshot = std::fs::read(fx.metadata_dir().join("1.snapshot.json")).unwrap();
    let mut timestamp: Metadata<Timestamp> = fx.read_repo("timestamp.json");
    timestamp.signed.version = 3;
    timestamp
        .signed
        .set_snapshot_meta(MetaFile::describing(1, &old_snapshot));
    timestamp.sign(&fx.key(RoleType::Timestamp)).unwrap();
    fx.write_repo("timestamp.json", &timestamp);

    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Snapshot,
                current: 2,
                received: 1
            }
        ),
        "{:?}",
        err
    );
    assert_eq!(fx.client_version(&updater, "timestamp.json"), 2);
    assert_eq!(fx.client_version(&updater, "snapshot.json"), 2);
}

#[test]
fn test_snapshot_pinning_older_targets_is_rollback() {
    let fx = Fixture::new();
    init_with_app(&fx);
    publish(&fx, b"second release");
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    // Snapshot 3 and timestamp 3 are properly signed, but targets goes back
    // to version 1.
    let old_targets = std::fs::read(fx.metadata_dir().join("1.targets.json")).unwrap();
    let mut snapshot: Metadata<Snapshot> = fx.read_repo("2.snapshot.json");
    snapshot.signed.version = 3;
    snapshot.signed.meta.insert(
        "targets.json".to_string(),
        MetaFile::describing(1, &old_targets),
    );
    snapshot.sign(&fx.key(RoleType::Snapshot)).unwrap();
    let snapshot_bytes = fx.write_repo("3.snapshot.json", &snapshot);

    let mut timestamp: Metadata<Timestamp> = fx.read_repo("timestamp.json");
    timestamp.signed.version = 3;
    timestamp
        .signed
        .set_snapshot_meta(MetaFile::describing(3, &snapshot_bytes));
    timestamp.sign(&fx.key(RoleType::Timestamp)).unwrap();
    fx.write_repo("timestamp.json", &timestamp);

    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Targets,
                current: 2,
                received: 1
            }
        ),
        "{:?}",
        err
    );
    assert_eq!(fx.client_version(&updater, "snapshot.json"), 2);
    assert_eq!(fx.client_version(&updater, "targets.json"), 2);
}

#[test]
fn test_targets_signed_by_revoked_key_after_rotation() {
    let fx = Fixture::new();
    init_with_app(&fx);
    let mut updater = fx.updater();
    updater.bootstrap_tofu().unwrap();
    updater.refresh().unwrap();

    // Root 2 replaces the targets key; targets itself is not republished.
    let mut root: Metadata<updraft_core::metadata::Root> = fx.read_repo("1.root.json");
    let old_targets_key = fx.key(RoleType::Targets);
    root.signed
        .revoke_key(RoleType::Targets, old_targets_key.key_id())
        .unwrap();
    root.signed
        .add_key(RoleType::Targets, updraft_core::KeyPair::generate().public_key())
        .unwrap();
    root.signed.version = 2;
    root.clear_signatures();
    root.sign(&fx.key(RoleType::Root)).unwrap();
    fx.write_repo("2.root.json", &root);

    let err = updater.refresh().unwrap_err();
    assert!(
        matches!(
            err,
            TufError::ThresholdNotMet {
                role: RoleType::Targets,
                ..
            }
        ),
        "{:?}",
        err
    );
    assert_eq!(fx.client_version(&updater, "root.json"), 2);
    assert!(!updater.metadata_dir().join("targets.json").exists());

    // A restarted client does not pick the old targets back up either.
    let mut restarted = fx.updater();
    assert!(restarted.refresh().is_err());
    assert!(restarted.get_target_info("app.exe").is_err());
}

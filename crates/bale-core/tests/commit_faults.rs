//! Fault injection around the commit step.
//!
//! Each test makes one step after the workers finish fail and checks that the
//! output directory holds no package, manifest, or signature afterwards.

use bale_core::{
    BuildOptions, BuildOutcome, BuildRequest, Ed25519Signer, Orchestrator, Reporter, SignError,
    Signer,
};
use bale_runtime::{CredentialSet, MockRuntime};
use bale_schema::PackageManifest;
use ed25519_dalek::SigningKey;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Signs normally, but first puts a directory where the manifest's `suffix`
/// file is about to be published.
struct OccupyingSigner {
    inner: Ed25519Signer,
    out_dir: PathBuf,
    suffix: &'static str,
}

impl Signer for OccupyingSigner {
    fn sign(&self, data: &[u8]) -> Result<String, SignError> {
        if let Ok(manifest) = PackageManifest::from_slice(data) {
            fs::create_dir(self.out_dir.join(format!("{}{}", manifest.id, self.suffix)))
                .unwrap();
        }
        self.inner.sign(data)
    }
}

/// Signs part digests but refuses the manifest.
struct ManifestRefusingSigner(Ed25519Signer);

impl Signer for ManifestRefusingSigner {
    fn sign(&self, data: &[u8]) -> Result<String, SignError> {
        if PackageManifest::from_slice(data).is_ok() {
            return Err(SignError::InvalidKey {
                path: PathBuf::from("token"),
                reason: "key revoked".to_owned(),
            });
        }
        self.0.sign(data)
    }
}

fn key() -> Ed25519Signer {
    Ed25519Signer::from_signing_key(SigningKey::from_bytes(&[21u8; 32]))
}

fn orchestrator(runtime: MockRuntime) -> Orchestrator {
    let reporter = Reporter::with_writers(
        Box::new(io::sink()),
        Box::new(io::sink()),
        Reporter::DEFAULT_BUFFER_LEN,
    );
    Orchestrator::new(Box::new(runtime), Arc::new(reporter)).unwrap()
}

fn request(out: &Path, images: &[&str]) -> BuildRequest {
    BuildRequest {
        output_dir: out.to_path_buf(),
        url_base: "https://cdn.example.com/packages".to_owned(),
        private_key: out.join("unused.pem"),
        author: "release@example.com".to_owned(),
        images: images.iter().map(|s| (*s).to_owned()).collect(),
        credentials: CredentialSet::default(),
        options: BuildOptions::default(),
    }
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn aborted(outcome: BuildOutcome) -> bale_core::AbortSummary {
    match outcome {
        BuildOutcome::Aborted(summary) => summary,
        other => panic!("expected an aborted build, got {other:?}"),
    }
}

#[test]
fn signature_publish_failure_rolls_back_package_dir() {
    let out = tempfile::tempdir().unwrap();
    let signer = OccupyingSigner {
        inner: key(),
        out_dir: out.path().to_path_buf(),
        suffix: ".json.sig",
    };
    let mut orch = orchestrator(MockRuntime::auto());
    let req = request(out.path(), &["xy.io/app:1", "xy.io/db:2"]);

    let summary = aborted(orch.build_with_signer(&req, &signer).unwrap());

    assert_eq!(summary.errors, 1);
    assert!(summary.kept_staging.is_none());
    let id = summary.id.as_str();
    // Only the directory planted by the signer remains.
    assert_eq!(entries(out.path()), [format!("{id}.json.sig")]);
    assert!(!out.path().join(id).exists());
    assert!(!out.path().join(format!("{id}.json")).exists());
}

#[test]
fn manifest_publish_failure_removes_signature() {
    let out = tempfile::tempdir().unwrap();
    let signer = OccupyingSigner {
        inner: key(),
        out_dir: out.path().to_path_buf(),
        suffix: ".json",
    };
    let mut orch = orchestrator(MockRuntime::auto());
    let req = request(out.path(), &["xy.io/app:1"]);

    let summary = aborted(orch.build_with_signer(&req, &signer).unwrap());

    let id = summary.id.as_str();
    assert_eq!(entries(out.path()), [format!("{id}.json")]);
    assert!(out.path().join(format!("{id}.json")).is_dir());
    assert!(!out.path().join(format!("{id}.json.sig")).exists());
    assert!(!out.path().join(id).exists());
}

#[test]
fn commit_failure_keeps_staging_when_asked() {
    let out = tempfile::tempdir().unwrap();
    let signer = OccupyingSigner {
        inner: key(),
        out_dir: out.path().to_path_buf(),
        suffix: ".json.sig",
    };
    let mut orch = orchestrator(MockRuntime::auto());
    let mut req = request(out.path(), &["xy.io/app:1"]);
    req.options.keep_failed = true;

    let summary = aborted(orch.build_with_signer(&req, &signer).unwrap());

    let kept = summary.kept_staging.expect("staging kept");
    let name = kept.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with(&format!("build-{}-", summary.id)));
    assert_eq!(fs::read_dir(&kept).unwrap().count(), 1);
    assert!(!out.path().join(summary.id.as_str()).exists());
    assert!(!out.path().join(format!("{}.json", summary.id)).exists());
}

#[test]
fn manifest_signing_failure_aborts_before_rename() {
    let out = tempfile::tempdir().unwrap();
    let signer = ManifestRefusingSigner(key());
    let mut orch = orchestrator(MockRuntime::auto());
    let req = request(out.path(), &["xy.io/app:1", "xy.io/db:2"]);

    let summary = aborted(orch.build_with_signer(&req, &signer).unwrap());

    assert_eq!(summary.errors, 1);
    assert!(summary.is_user_error());
    assert!(entries(out.path()).is_empty());
}

#[test]
fn orchestrator_commits_after_a_failed_commit() {
    let out = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(MockRuntime::auto());
    let req = request(out.path(), &["xy.io/app:1"]);

    aborted(
        orch.build_with_signer(&req, &ManifestRefusingSigner(key()))
            .unwrap(),
    );
    let outcome = orch.build_with_signer(&req, &key()).unwrap();
    assert!(matches!(outcome, BuildOutcome::Committed(_)));
}

/// Every manifest visible in `out` must point at a package directory that
/// already holds all of its parts. Returns how many manifests were checked.
fn check_visible_manifests(out: &Path) -> usize {
    let mut checked = 0;
    for name in entries(out) {
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let manifest = PackageManifest::from_slice(&fs::read(out.join(&name)).unwrap()).unwrap();
        let package_dir = out.join(manifest.id.as_str());
        assert!(package_dir.is_dir(), "{name} visible before its package directory");
        for part in manifest.parts.values() {
            let file = package_dir.join(format!("{}.tgz", part.digest));
            let len = fs::metadata(&file)
                .unwrap_or_else(|e| panic!("{name} visible before {}: {e}", file.display()))
                .len();
            assert_eq!(len as i64, part.size_bytes);
        }
        checked += 1;
    }
    checked
}

#[test]
fn poller_never_sees_manifest_before_parts() {
    let out = tempfile::tempdir().unwrap();
    let rt = MockRuntime::auto().with_export_delay(Duration::from_millis(50));
    let mut orch = orchestrator(rt);
    let req = request(
        out.path(),
        &["xy.io/a:1", "xy.io/b:1", "xy.io/c:1", "xy.io/d:1"],
    );
    let signer = key();
    let done = AtomicBool::new(false);

    let checked = std::thread::scope(|s| {
        let poller = s.spawn(|| {
            let mut checked = 0;
            loop {
                let finished = done.load(Ordering::SeqCst);
                checked += check_visible_manifests(out.path());
                if finished {
                    break checked;
                }
                std::thread::yield_now();
            }
        });

        let outcome = orch.build_with_signer(&req, &signer).unwrap();
        done.store(true, Ordering::SeqCst);
        assert!(matches!(outcome, BuildOutcome::Committed(_)));
        poller.join().unwrap()
    });

    assert!(checked >= 1);
}

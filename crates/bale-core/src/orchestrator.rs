use crate::concurrency::shutdown_requested;
use crate::lifecycle::{validate_transition, BuildPhase};
use crate::reporter::{DelegateError, Reporter};
use crate::signer::{Ed25519Signer, Signer};
use crate::worker::{run_part_worker, WorkerContext, WorkerOptions};
use crate::CoreError;
use bale_runtime::{ContainerRuntime, CredentialSet};
use bale_schema::{Codec, PackageBuilder, PackageId, PullPolicy};
use bale_store::{OutputLayout, StagedFile, StagingDir, PUBLIC_DIR_MODE, PUBLIC_FILE_MODE};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// Knobs that do not change which package is built, only how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub pull: PullPolicy,
    pub allow_anonymous_pull: bool,
    pub codec: Codec,
    /// Leave the staging directory in place when a build aborts.
    pub keep_failed: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        let worker = WorkerOptions::default();
        Self {
            pull: worker.pull,
            allow_anonymous_pull: worker.allow_anonymous_pull,
            codec: worker.codec,
            keep_failed: false,
        }
    }
}

impl BuildOptions {
    fn worker(self) -> WorkerOptions {
        WorkerOptions {
            pull: self.pull,
            allow_anonymous_pull: self.allow_anonymous_pull,
            codec: self.codec,
        }
    }
}

/// One package build: where to write it, how to sign it, and what goes in it.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub output_dir: PathBuf,
    /// Base under which the package directory will be served.
    pub url_base: String,
    pub private_key: PathBuf,
    pub author: String,
    pub images: Vec<String>,
    pub credentials: CredentialSet,
    pub options: BuildOptions,
}

/// Paths of a package that has been made visible in the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedPackage {
    pub id: PackageId,
    pub package_dir: PathBuf,
    pub manifest_file: PathBuf,
    pub signature_file: PathBuf,
    pub parts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortSummary {
    pub id: PackageId,
    /// Errors reported during this build.
    pub errors: usize,
    /// How many of those were caused by caller input.
    pub user_errors: usize,
    /// Staging directory left on disk, when asked to keep it.
    pub kept_staging: Option<PathBuf>,
}

impl AbortSummary {
    /// True when every reported error was caused by caller input.
    pub fn is_user_error(&self) -> bool {
        self.errors > 0 && self.user_errors == self.errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    InProgress,
    Committed(CommittedPackage),
    Aborted(AbortSummary),
}

#[derive(Debug, Default)]
struct ErrorState {
    breaking: AtomicBool,
    user_errors: AtomicUsize,
}

impl ErrorState {
    fn reset(&self) {
        self.breaking.store(false, Ordering::SeqCst);
        self.user_errors.store(0, Ordering::SeqCst);
    }
}

struct PreparedCommit {
    manifest: StagedFile,
    signature: StagedFile,
    parts: usize,
}

struct PublishFailure {
    error: CoreError,
    kept: Option<PathBuf>,
}

/// Runs package builds: one concurrent worker per image, then an atomic commit
/// if and only if no error was reported.
///
/// The orchestrator is the reporter's error consumer; constructing a second
/// orchestrator over the same reporter fails.
pub struct Orchestrator {
    runtime: Box<dyn ContainerRuntime>,
    reporter: Arc<Reporter>,
    errors: Arc<ErrorState>,
    phase: BuildPhase,
    outcome: BuildOutcome,
}

impl Orchestrator {
    pub fn new(
        runtime: Box<dyn ContainerRuntime>,
        reporter: Arc<Reporter>,
    ) -> Result<Self, CoreError> {
        let errors = Arc::new(ErrorState::default());
        let state = Arc::clone(&errors);
        let sink = Arc::downgrade(&reporter);
        reporter.register_error_consumer(move |e: &DelegateError| {
            if e.user_error {
                state.user_errors.fetch_add(1, Ordering::SeqCst);
            }
            if e.breaking {
                state.breaking.store(true, Ordering::SeqCst);
            }
            if let Some(reporter) = sink.upgrade() {
                reporter.error(e.message());
            }
        })?;

        Ok(Self {
            runtime,
            reporter,
            errors,
            phase: BuildPhase::Initializing,
            outcome: BuildOutcome::InProgress,
        })
    }

    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    pub fn outcome(&self) -> &BuildOutcome {
        &self.outcome
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Build the package, signing with the PEM key named in the request.
    ///
    /// Problems found before any worker starts are returned as `Err`; once
    /// workers are running every failure ends in [`BuildOutcome::Aborted`].
    pub fn build(&mut self, req: &BuildRequest) -> Result<BuildOutcome, CoreError> {
        self.begin()?;
        let result = Ed25519Signer::load_pem(&req.private_key)
            .map_err(CoreError::from)
            .and_then(|signer| self.run(req, &signer));
        self.finish(result)
    }

    /// Same as [`build`](Self::build) with an already-loaded signer.
    pub fn build_with_signer(
        &mut self,
        req: &BuildRequest,
        signer: &dyn Signer,
    ) -> Result<BuildOutcome, CoreError> {
        self.begin()?;
        let result = self.run(req, signer);
        self.finish(result)
    }

    fn begin(&mut self) -> Result<(), CoreError> {
        if self.phase != BuildPhase::Initializing {
            self.advance(BuildPhase::Initializing)?;
        }
        self.outcome = BuildOutcome::InProgress;
        self.errors.reset();
        Ok(())
    }

    fn finish(
        &mut self,
        result: Result<BuildOutcome, CoreError>,
    ) -> Result<BuildOutcome, CoreError> {
        match result {
            Ok(outcome) => {
                self.outcome = outcome.clone();
                Ok(outcome)
            }
            Err(e) => {
                error!("build failed in phase {}: {e}", self.phase);
                self.phase = BuildPhase::Aborted;
                Err(e)
            }
        }
    }

    fn advance(&mut self, to: BuildPhase) -> Result<(), CoreError> {
        validate_transition(self.phase, to)?;
        debug!("build phase {} -> {to}", self.phase);
        self.phase = to;
        Ok(())
    }

    fn run(&mut self, req: &BuildRequest, signer: &dyn Signer) -> Result<BuildOutcome, CoreError> {
        let baseline = self.reporter.error_count();

        let layout = OutputLayout::new(&req.output_dir);
        layout.check_writable()?;
        let url_base = parse_url_base(&req.url_base)?;
        let builder = PackageBuilder::new(&req.author, &req.images)?;
        let staging = StagingDir::create(&layout, builder.id())?;
        info!(
            "building package {} from {} image(s)",
            builder.id(),
            builder.images().len()
        );
        self.reporter.info(&format!(
            "Created temporary directory for packaging: {}",
            staging.path().display()
        ));

        self.advance(BuildPhase::Building)?;
        let ctx = WorkerContext {
            runtime: self.runtime.as_ref(),
            reporter: &self.reporter,
            builder: &builder,
            signer,
            credentials: &req.credentials,
            staging_dir: staging.path(),
            url_base: &url_base,
            options: req.options.worker(),
        };
        run_workers(&ctx, builder.images());

        if shutdown_requested() && self.reporter.error_count() == baseline {
            self.reporter
                .report_error(false, true, "Build interrupted before all parts were processed");
        }
        if self.reporter.error_count() > baseline || self.errors.breaking.load(Ordering::SeqCst) {
            self.reporter
                .error("Not all parts were processed successfully, discontinuing");
            return self.abort(staging, builder.id(), baseline, req.options.keep_failed);
        }

        self.advance(BuildPhase::Committing)?;
        let prepared = match self.prepare_commit(&layout, &builder, signer) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.reporter.report_error(
                    e.is_user_error(),
                    true,
                    format!("Error preparing package {}: {e}", builder.id()),
                );
                return self.abort(staging, builder.id(), baseline, req.options.keep_failed);
            }
        };

        match self.publish(&layout, builder.id(), staging, prepared, req.options.keep_failed) {
            Ok(package) => {
                self.advance(BuildPhase::Committed)?;
                info!("committed package {}", package.id);
                Ok(BuildOutcome::Committed(package))
            }
            Err(failure) => {
                self.reporter.report_error(
                    failure.error.is_user_error(),
                    true,
                    format!("Error committing package {}: {}", builder.id(), failure.error),
                );
                self.report_kept(failure.kept.as_deref());
                self.advance(BuildPhase::Aborted)?;
                Ok(BuildOutcome::Aborted(self.summary(
                    builder.id(),
                    baseline,
                    failure.kept,
                )))
            }
        }
    }

    fn prepare_commit(
        &self,
        layout: &OutputLayout,
        builder: &PackageBuilder,
        signer: &dyn Signer,
    ) -> Result<PreparedCommit, CoreError> {
        let id = builder.id();
        let (manifest, bytes) = builder.build()?;
        let signature = signer.sign(&bytes)?;

        let manifest_file =
            StagedFile::with_contents(layout.root(), &format!(".{id}.json-"), &bytes)?;
        let signature_file = StagedFile::with_contents(
            layout.root(),
            &format!(".{id}.json.sig-"),
            signature.as_bytes(),
        )?;
        self.reporter.info("Signed package manifest");

        Ok(PreparedCommit {
            manifest: manifest_file,
            signature: signature_file,
            parts: manifest.parts.len(),
        })
    }

    /// Package directory first, then the signature, then the manifest.
    ///
    /// A manifest in the output directory therefore always refers to a
    /// complete package directory. Any failure after the directory rename
    /// rolls the rename back, so an aborted build leaves no package behind.
    fn publish(
        &self,
        layout: &OutputLayout,
        id: &PackageId,
        staging: StagingDir,
        prepared: PreparedCommit,
        keep: bool,
    ) -> Result<CommittedPackage, PublishFailure> {
        let package_dir = staging
            .commit(&layout.package_dir(id), PUBLIC_DIR_MODE)
            .map_err(|e| PublishFailure {
                error: e.into(),
                kept: None,
            })?;
        self.reporter.info(&format!(
            "Moved package content to: {}",
            package_dir.path().display()
        ));

        match Self::publish_documents(layout, id, prepared.manifest, prepared.signature) {
            Ok((manifest_file, signature_file)) => {
                self.reporter.info(&format!(
                    "Wrote package manifest to: {}",
                    manifest_file.display()
                ));
                Ok(CommittedPackage {
                    id: id.clone(),
                    package_dir: package_dir.finish(),
                    manifest_file,
                    signature_file,
                    parts: prepared.parts,
                })
            }
            Err(error) => {
                let kept = match package_dir.roll_back(keep) {
                    Ok(kept) => kept,
                    Err(e) => {
                        warn!("failed to roll back package directory: {e}");
                        self.reporter
                            .warn(&format!("Failed to roll back package directory: {e}"));
                        None
                    }
                };
                Err(PublishFailure { error, kept })
            }
        }
    }

    /// Rename the signature, then the manifest, into place. On failure
    /// neither is left at its permanent name.
    fn publish_documents(
        layout: &OutputLayout,
        id: &PackageId,
        manifest: StagedFile,
        signature: StagedFile,
    ) -> Result<(PathBuf, PathBuf), CoreError> {
        let signature_dest = layout.signature_file(id);
        let manifest_dest = layout.manifest_file(id);
        let published = signature
            .publish(&signature_dest, PUBLIC_FILE_MODE)
            .and_then(|sig| Ok((manifest.publish(&manifest_dest, PUBLIC_FILE_MODE)?, sig)));
        published.map_err(|e| {
            for path in [&manifest_dest, &signature_dest] {
                if path.is_file() {
                    let _ = std::fs::remove_file(path);
                }
            }
            e.into()
        })
    }

    fn report_kept(&self, kept: Option<&Path>) {
        if let Some(path) = kept {
            self.reporter.warn(&format!(
                "Kept staging directory for inspection: {}",
                path.display()
            ));
        }
    }

    fn abort(
        &mut self,
        staging: StagingDir,
        id: &PackageId,
        baseline: usize,
        keep: bool,
    ) -> Result<BuildOutcome, CoreError> {
        let kept = match staging.abandon(keep) {
            Ok(kept) => kept,
            Err(e) => {
                warn!("failed to remove staging directory: {e}");
                self.reporter
                    .warn(&format!("Failed to remove staging directory: {e}"));
                None
            }
        };
        self.report_kept(kept.as_deref());
        self.advance(BuildPhase::Aborted)?;
        Ok(BuildOutcome::Aborted(self.summary(id, baseline, kept)))
    }

    fn summary(&self, id: &PackageId, baseline: usize, kept: Option<PathBuf>) -> AbortSummary {
        AbortSummary {
            id: id.clone(),
            errors: self.reporter.error_count().saturating_sub(baseline),
            user_errors: self.errors.user_errors.load(Ordering::SeqCst),
            kept_staging: kept,
        }
    }
}

/// Start every worker at once and wait for all of them.
///
/// A worker that cannot be started or that panics is reported here, so each
/// image still produces exactly one part or one error.
fn run_workers(ctx: &WorkerContext<'_>, images: &[String]) {
    std::thread::scope(|scope| {
        let handles: Vec<_> = images
            .iter()
            .enumerate()
            .map(|(i, image)| {
                let spawned = std::thread::Builder::new()
                    .name(format!("part-worker-{i}"))
                    .spawn_scoped(scope, move || run_part_worker(ctx, image));
                (image, spawned)
            })
            .collect();

        for (image, spawned) in handles {
            let failure = match spawned {
                Ok(handle) => handle
                    .join()
                    .err()
                    .map(|_| format!("Worker for image {image} panicked")),
                Err(e) => Some(format!("Unable to start worker for image {image}: {e}")),
            };
            if let Some(message) = failure {
                ctx.reporter.report_error(false, true, message);
            }
        }
    });
}

fn parse_url_base(raw: &str) -> Result<Url, CoreError> {
    let url = Url::parse(raw.trim()).map_err(|e| CoreError::InvalidUrlBase {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(CoreError::InvalidUrlBase {
            url: raw.to_owned(),
            reason: "URL cannot carry a path".to_owned(),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::testing::captured;
    use bale_runtime::MockRuntime;
    use ed25519_dalek::SigningKey;

    fn request(dir: &Path, images: &[&str]) -> BuildRequest {
        BuildRequest {
            output_dir: dir.to_path_buf(),
            url_base: "https://cdn.example.com/pkgs".to_owned(),
            private_key: dir.join("unused.pem"),
            author: "dev@example.com".to_owned(),
            images: images.iter().map(|s| (*s).to_owned()).collect(),
            credentials: CredentialSet::default(),
            options: BuildOptions::default(),
        }
    }

    fn signer() -> Ed25519Signer {
        Ed25519Signer::from_signing_key(SigningKey::from_bytes(&[5u8; 32]))
    }

    #[test]
    fn url_base_must_be_hierarchical() {
        assert!(parse_url_base("https://cdn.example.com/x").is_ok());
        assert!(matches!(
            parse_url_base("mailto:ops@example.com"),
            Err(CoreError::InvalidUrlBase { .. })
        ));
        assert!(matches!(
            parse_url_base("not a url"),
            Err(CoreError::InvalidUrlBase { .. })
        ));
    }

    #[test]
    fn second_orchestrator_on_same_reporter_fails() {
        let (reporter, _, _) = captured();
        let _first = Orchestrator::new(Box::new(MockRuntime::auto()), Arc::clone(&reporter)).unwrap();
        assert!(matches!(
            Orchestrator::new(Box::new(MockRuntime::auto()), reporter),
            Err(CoreError::Reporter(_))
        ));
    }

    #[test]
    fn committed_build_moves_through_phases() {
        let dir = tempfile::tempdir().unwrap();
        let (reporter, _, _) = captured();
        let mut orch = Orchestrator::new(Box::new(MockRuntime::auto()), reporter).unwrap();
        assert_eq!(orch.outcome(), &BuildOutcome::InProgress);

        let outcome = orch
            .build_with_signer(&request(dir.path(), &["xy.io/a:1"]), &signer())
            .unwrap();
        assert!(matches!(outcome, BuildOutcome::Committed(_)));
        assert_eq!(orch.phase(), BuildPhase::Committed);
        assert_eq!(orch.outcome(), &outcome);
    }

    #[test]
    fn init_failure_is_returned_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (reporter, _, _) = captured();
        let mut orch =
            Orchestrator::new(Box::new(MockRuntime::auto()), Arc::clone(&reporter)).unwrap();
        let mut req = request(dir.path(), &["xy.io/a:1"]);
        req.output_dir = dir.path().join("missing");

        let err = orch.build_with_signer(&req, &signer()).unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(reporter.error_count(), 0);
        assert_eq!(orch.phase(), BuildPhase::Aborted);
    }

    #[test]
    fn orchestrator_is_reusable_after_abort() {
        let dir = tempfile::tempdir().unwrap();
        let (reporter, _, _) = captured();
        let rt = MockRuntime::auto().with_failing_export("xy.io/bad:1");
        let mut orch = Orchestrator::new(Box::new(rt), reporter).unwrap();

        let first = orch
            .build_with_signer(&request(dir.path(), &["xy.io/bad:1"]), &signer())
            .unwrap();
        let BuildOutcome::Aborted(summary) = first else {
            panic!("expected abort");
        };
        assert_eq!(summary.errors, 1);
        assert!(!summary.is_user_error());

        let second = orch
            .build_with_signer(&request(dir.path(), &["xy.io/good:1"]), &signer())
            .unwrap();
        assert!(matches!(second, BuildOutcome::Committed(_)));
    }

    #[test]
    fn images_can_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let (reporter, _, _) = captured();
        let rt = MockRuntime::auto();
        let mut orch = Orchestrator::new(Box::new(rt), reporter).unwrap();
        let outcome = orch
            .build_with_signer(
                &request(dir.path(), &["xy.io/a:1", "xy.io/a:1"]),
                &signer(),
            )
            .unwrap();
        let BuildOutcome::Committed(pkg) = outcome else {
            panic!("expected commit");
        };
        assert_eq!(pkg.parts, 1);
    }
}

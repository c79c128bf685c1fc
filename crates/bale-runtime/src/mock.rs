use crate::backend::ContainerRuntime;
use crate::credentials::Credential;
use crate::RuntimeError;
use bale_schema::ImageRef;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A pull observed by the mock, with the credential it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRecord {
    pub image: String,
    pub credential: Option<Credential>,
}

#[derive(Default)]
struct MockState {
    local: HashMap<String, Vec<u8>>,
    registry: HashMap<String, Vec<u8>>,
    failing_exports: HashSet<String>,
    inspections: Vec<String>,
    pulls: Vec<PullRecord>,
    exports: Vec<String>,
}

/// In-memory runtime for tests and dry runs.
///
/// In `auto` mode every reference exists locally with content derived from
/// its name; otherwise images must be seeded with
/// [`with_local_image`](Self::with_local_image) or
/// [`with_registry_image`](Self::with_registry_image).
#[derive(Default)]
pub struct MockRuntime {
    auto: bool,
    unreachable: bool,
    export_delay: Option<Duration>,
    state: Mutex<MockState>,
    active_exports: AtomicUsize,
    peak_exports: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto() -> Self {
        Self {
            auto: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_local_image(self, image: &str, content: &[u8]) -> Self {
        self.seed(|s| {
            s.local.insert(image.to_owned(), content.to_vec());
        })
    }

    #[must_use]
    pub fn with_registry_image(self, image: &str, content: &[u8]) -> Self {
        self.seed(|s| {
            s.registry.insert(image.to_owned(), content.to_vec());
        })
    }

    #[must_use]
    pub fn with_failing_export(self, image: &str) -> Self {
        self.seed(|s| {
            s.failing_exports.insert(image.to_owned());
        })
    }

    /// Every call fails as if the daemon were down.
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    #[must_use]
    pub fn with_export_delay(mut self, delay: Duration) -> Self {
        self.export_delay = Some(delay);
        self
    }

    fn seed(self, f: impl FnOnce(&mut MockState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    fn check_reachable(&self) -> Result<(), RuntimeError> {
        if self.unreachable {
            Err(RuntimeError::Unreachable(
                "mock daemon is not running".to_owned(),
            ))
        } else {
            Ok(())
        }
    }

    /// References passed to `image_exists`, in call order.
    pub fn inspections(&self) -> Vec<String> {
        self.lock().map(|s| s.inspections.clone()).unwrap_or_default()
    }

    pub fn pulls(&self) -> Vec<PullRecord> {
        self.lock().map(|s| s.pulls.clone()).unwrap_or_default()
    }

    pub fn exports(&self) -> Vec<String> {
        self.lock().map(|s| s.exports.clone()).unwrap_or_default()
    }

    /// Highest number of exports observed running at the same time.
    pub fn peak_concurrent_exports(&self) -> usize {
        self.peak_exports.load(Ordering::SeqCst)
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn ping(&self) -> Result<(), RuntimeError> {
        self.check_reachable()
    }

    fn image_exists(&self, image: &ImageRef) -> Result<bool, RuntimeError> {
        self.check_reachable()?;
        let mut state = self.lock()?;
        state.inspections.push(image.to_string());
        Ok(self.auto || state.local.contains_key(image.as_str()))
    }

    fn pull(&self, image: &ImageRef, credential: Option<&Credential>) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        let mut state = self.lock()?;
        state.pulls.push(PullRecord {
            image: image.to_string(),
            credential: credential.cloned(),
        });
        if self.auto {
            return Ok(());
        }
        match state.registry.get(image.as_str()).cloned() {
            Some(content) => {
                state.local.insert(image.to_string(), content);
                Ok(())
            }
            None => Err(RuntimeError::ImageNotFound(image.to_string())),
        }
    }

    fn export(&self, image: &ImageRef, sink: &mut dyn Write) -> Result<u64, RuntimeError> {
        self.check_reachable()?;
        let content = {
            let mut state = self.lock()?;
            state.exports.push(image.to_string());
            if state.failing_exports.contains(image.as_str()) {
                return Err(RuntimeError::ExportFailed {
                    image: image.to_string(),
                    reason: "mock export failure".to_owned(),
                });
            }
            match state.local.get(image.as_str()) {
                Some(c) => c.clone(),
                None if self.auto => format!("mock-image:{image}").into_bytes(),
                None => return Err(RuntimeError::ImageNotFound(image.to_string())),
            }
        };

        let active = self.active_exports.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_exports.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.export_delay {
            std::thread::sleep(delay);
        }
        let written = image_archive(image, &content).and_then(|archive| {
            sink.write_all(&archive)?;
            Ok(archive.len() as u64)
        });
        self.active_exports.fetch_sub(1, Ordering::SeqCst);
        Ok(written?)
    }
}

/// Deterministic `docker save`-shaped tar: a manifest plus one layer file.
fn image_archive(image: &ImageRef, content: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let layer_name = format!("{}/layer.tar", blake3::hash(content).to_hex());
    let manifest = format!(
        r#"[{{"Config":"config.json","RepoTags":["{image}"],"Layers":["{layer_name}"]}}]"#
    );

    let mut ar = tar::Builder::new(Vec::new());
    append(&mut ar, "manifest.json", manifest.as_bytes())?;
    append(&mut ar, &layer_name, content)?;
    ar.into_inner()
}

fn append(ar: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_cksum();
    ar.append_data(&mut header, path, data)
}

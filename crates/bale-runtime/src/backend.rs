use crate::credentials::Credential;
use crate::RuntimeError;
use bale_schema::ImageRef;
use std::io::Write;
use std::sync::Arc;

/// Source of container images for a package build.
///
/// Implementations are shared by every part worker, so all methods take
/// `&self` and must be safe to call concurrently.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Check that the runtime answers before any image work starts.
    fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Whether `image` is present in the local image store.
    fn image_exists(&self, image: &ImageRef) -> Result<bool, RuntimeError>;

    /// Pull `image` from its registry, authenticating with `credential` when given.
    fn pull(&self, image: &ImageRef, credential: Option<&Credential>) -> Result<(), RuntimeError>;

    /// Stream the image's canonical, uncompressed tar archive into `sink`.
    /// Returns the number of bytes written.
    fn export(&self, image: &ImageRef, sink: &mut dyn Write) -> Result<u64, RuntimeError>;
}

impl<T: ContainerRuntime + ?Sized> ContainerRuntime for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn ping(&self) -> Result<(), RuntimeError> {
        (**self).ping()
    }

    fn image_exists(&self, image: &ImageRef) -> Result<bool, RuntimeError> {
        (**self).image_exists(image)
    }

    fn pull(&self, image: &ImageRef, credential: Option<&Credential>) -> Result<(), RuntimeError> {
        (**self).pull(image, credential)
    }

    fn export(&self, image: &ImageRef, sink: &mut dyn Write) -> Result<u64, RuntimeError> {
        (**self).export(image, sink)
    }
}

pub fn select_runtime(
    name: &str,
    endpoint: Option<&str>,
) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "docker" => Ok(Box::new(crate::docker::DockerCliRuntime::new(endpoint))),
        "mock" => Ok(Box::new(crate::mock::MockRuntime::auto())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_runtimes() {
        assert_eq!(select_runtime("docker", None).unwrap().name(), "docker");
        assert_eq!(
            select_runtime("mock", Some("unix:///x")).unwrap().name(),
            "mock"
        );
    }

    #[test]
    fn shared_runtime_delegates() {
        let rt = Arc::new(crate::mock::MockRuntime::auto());
        let shared: Box<dyn ContainerRuntime> = Box::new(Arc::clone(&rt));
        let image = ImageRef::parse("xy.io/a:1").unwrap();
        assert!(shared.image_exists(&image).unwrap());
        assert_eq!(rt.inspections(), ["xy.io/a:1"]);
    }

    #[test]
    fn select_invalid_runtime_fails() {
        assert!(matches!(
            select_runtime("podman-compose", None),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }
}

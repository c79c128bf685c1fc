use crate::codec;
use crate::reporter::Reporter;
use crate::signer::{SignError, Signer};
use bale_runtime::{ContainerRuntime, CredentialSet, RuntimeError};
use bale_schema::{Codec, ImageRef, PackageBuilder, PackageId, Part, PullPolicy, SchemaError};
use bale_store::{StagedFile, StoreError, PUBLIC_FILE_MODE};
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("no credentials for registry '{0}' and anonymous pulls are disabled")]
    MissingCredentials(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),
    #[error("cannot derive a source URL from base '{0}'")]
    SourceUrl(String),
}

impl WorkerError {
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Schema(e) => e.is_user_error(),
            Self::Runtime(e) => e.is_user_error(),
            Self::MissingCredentials(_) => true,
            Self::Store(_) | Self::Io(_) | Self::Sign(_) | Self::SourceUrl(_) => false,
        }
    }
}

/// How a worker obtains and stores its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub pull: PullPolicy,
    pub allow_anonymous_pull: bool,
    pub codec: Codec,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            pull: PullPolicy::IfMissing,
            allow_anonymous_pull: true,
            codec: Codec::Gzip,
        }
    }
}

/// Everything a part worker borrows from the build that spawned it.
#[derive(Clone, Copy)]
pub struct WorkerContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub reporter: &'a Reporter,
    pub builder: &'a PackageBuilder,
    pub signer: &'a dyn Signer,
    pub credentials: &'a CredentialSet,
    pub staging_dir: &'a Path,
    pub url_base: &'a Url,
    pub options: WorkerOptions,
}

/// Writer adapter that hashes every byte on its way to `inner`.
pub struct DigestWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn finalize(&self) -> blake3::Hash {
        self.hasher.finalize()
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Turn one image reference into a registered part.
///
/// Success or failure is signalled exactly once: a part in the builder, or a
/// single breaking error through the reporter.
pub fn run_part_worker(ctx: &WorkerContext<'_>, image: &str) -> Option<Part> {
    ctx.reporter
        .info(&format!("Beginning processing image: {image}"));
    match process_image(ctx, image) {
        Ok(part) => {
            ctx.reporter.info(&format!(
                "Registered part {} for image {image} ({} bytes)",
                part.id, part.size_bytes
            ));
            Some(part)
        }
        Err(e) => {
            ctx.reporter.report_error(
                e.is_user_error(),
                true,
                format!("Error processing image {image}: {e}"),
            );
            None
        }
    }
}

fn process_image(ctx: &WorkerContext<'_>, raw: &str) -> Result<Part, WorkerError> {
    let image = ImageRef::parse(raw)?;
    ensure_present(ctx, &image)?;

    let (exported, digest) = export_image(ctx, &image)?;
    let digest_hex = digest.to_hex().to_string();

    let file_name = format!("{digest_hex}.{}", ctx.options.codec.extension());
    let size = store_part(ctx, &exported, &digest_hex, &file_name)?;
    drop(exported);

    let signature = ctx.signer.sign(digest.as_bytes())?;
    let url = source_url(ctx.url_base, ctx.builder.id(), &file_name)?;

    let part = Part::from_digest(digest_hex, &image, vec![signature], size as i64, url);
    Ok(ctx.builder.add_part(part)?)
}

fn ensure_present(ctx: &WorkerContext<'_>, image: &ImageRef) -> Result<(), WorkerError> {
    match ctx.options.pull {
        PullPolicy::Never => {
            debug!("assuming {image} is present locally");
            return Ok(());
        }
        PullPolicy::IfMissing => {
            if ctx.runtime.image_exists(image)? {
                debug!("{image} already present locally");
                return Ok(());
            }
        }
        PullPolicy::Always => {}
    }

    let server = image.server_address();
    let credential = server.and_then(|s| ctx.credentials.find(s));
    if credential.is_none() && !ctx.options.allow_anonymous_pull {
        return Err(WorkerError::MissingCredentials(
            server.unwrap_or("default registry").to_owned(),
        ));
    }

    let mode = if credential.is_some() {
        "authenticated"
    } else {
        "anonymous"
    };
    ctx.reporter
        .info(&format!("Pulling image {image} ({mode})"));
    ctx.runtime.pull(image, credential)?;
    Ok(())
}

fn export_image(
    ctx: &WorkerContext<'_>,
    image: &ImageRef,
) -> Result<(StagedFile, blake3::Hash), WorkerError> {
    let mut staged = StagedFile::create_in(ctx.staging_dir, &format!(".{}-", image.file_stem()))?;
    let (digest, written) = {
        let mut tee = DigestWriter::new(staged.file_mut());
        let written = ctx.runtime.export(image, &mut tee)?;
        tee.flush()?;
        (tee.finalize(), written)
    };
    info!("exported {image}: {written} bytes, digest {digest}");
    ctx.reporter.info(&format!(
        "Exported image {image} to {} ({written} bytes)",
        staged.path().display()
    ));
    Ok((staged, digest))
}

fn store_part(
    ctx: &WorkerContext<'_>,
    exported: &StagedFile,
    digest_hex: &str,
    file_name: &str,
) -> Result<u64, WorkerError> {
    let mut source = exported.reopen()?;
    let mut out = StagedFile::create_in(ctx.staging_dir, &format!(".{digest_hex}-"))?;
    let size = codec::compress(ctx.options.codec, &mut source, out.file_mut())?;
    let dest = out.publish(&ctx.staging_dir.join(file_name), PUBLIC_FILE_MODE)?;
    ctx.reporter.info(&format!(
        "Compressed image to {} ({size} bytes)",
        dest.display()
    ));
    Ok(size)
}

/// `<base>/<package id>/<file name>`, regardless of a trailing slash on `base`.
pub fn source_url(base: &Url, id: &PackageId, file_name: &str) -> Result<String, WorkerError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| WorkerError::SourceUrl(base.to_string()))?
        .pop_if_empty()
        .push(id.as_str())
        .push(file_name);
    Ok(url.into())
}

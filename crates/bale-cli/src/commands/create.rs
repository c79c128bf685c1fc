use super::{json_pretty, CliError, EXIT_FAILURE, EXIT_SUCCESS, EXIT_USER_ERROR};
use bale_core::{BuildOptions, BuildOutcome, BuildRequest, CommittedPackage, Orchestrator, Reporter};
use bale_runtime::{select_runtime, ContainerRuntime, CredentialSet};
use bale_schema::{parse_config_file, BuildConfig, Codec, PullPolicy};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PullArg {
    /// Pull only images that are not present locally.
    IfMissing,
    /// Pull every image, even when present.
    Always,
    /// Never pull; every image must already be present.
    Never,
}

impl From<PullArg> for PullPolicy {
    fn from(arg: PullArg) -> Self {
        match arg {
            PullArg::IfMissing => Self::IfMissing,
            PullArg::Always => Self::Always,
            PullArg::Never => Self::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CodecArg {
    Gzip,
    Zstd,
    None,
}

impl From<CodecArg> for Codec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Gzip => Self::Gzip,
            CodecArg::Zstd => Self::Zstd,
            CodecArg::None => Self::None,
        }
    }
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Image reference to include, as repository:tag. Repeatable.
    #[arg(short, long = "image", env = "BALE_IMAGES", value_delimiter = ',')]
    pub images: Vec<String>,

    /// Directory the package, manifest, and signature are written to.
    #[arg(short = 'd', long, env = "BALE_OUTPUTDIR")]
    pub output_dir: Option<PathBuf>,

    /// URL under which the output directory will be served.
    #[arg(short, long, env = "BALE_URLBASE")]
    pub url_base: Option<String>,

    /// PKCS#8 PEM Ed25519 private key used for signing.
    #[arg(short = 'k', long, env = "BALE_PRIVATEKEY")]
    pub private_key: Option<PathBuf>,

    /// Author recorded in the package manifest.
    #[arg(short, long, env = "BALE_AUTHOR")]
    pub author: Option<String>,

    /// Docker-style config.json holding registry credentials.
    #[arg(long, env = "BALE_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Container runtime backend.
    #[arg(long, env = "BALE_RUNTIME", default_value = "docker")]
    pub runtime: String,

    /// Daemon endpoint handed to the runtime, e.g. unix:///var/run/docker.sock.
    #[arg(long, env = "BALE_DOCKERENDPOINT")]
    pub docker_endpoint: Option<String>,

    /// When to pull images from their registry.
    #[arg(long, value_enum)]
    pub pull: Option<PullArg>,

    /// Fail instead of pulling anonymously when no credential matches.
    #[arg(long, default_value_t = false)]
    pub no_anonymous_pull: bool,

    /// Compression applied to each part.
    #[arg(long, value_enum)]
    pub codec: Option<CodecArg>,

    /// Keep the staging directory when the build aborts.
    #[arg(long, default_value_t = false)]
    pub keep_failed: bool,

    /// TOML file with defaults for any of the settings above.
    #[arg(short, long, env = "BALE_CONFIG")]
    pub config: Option<PathBuf>,
}

fn required<T>(value: Option<T>, name: &str, flag: &str, env: &str) -> Result<T, CliError> {
    value.ok_or_else(|| {
        CliError::user(format!(
            "missing required setting '{name}' (use {flag}, {env}, or the config file)"
        ))
    })
}

impl CreateArgs {
    /// Merge flags over config file values into a build request.
    pub fn into_request(self, config: BuildConfig) -> Result<BuildRequest, CliError> {
        let images = if self.images.is_empty() {
            config.images
        } else {
            self.images
        };
        if images.iter().all(|i| i.trim().is_empty()) {
            return Err(CliError::user(
                "no images given (use --image, BALE_IMAGES, or the config file)",
            ));
        }

        let credentials_file = self.credentials.or(config.credentials);
        let credentials = match credentials_file {
            Some(path) => CredentialSet::load(&path).map_err(|e| {
                CliError::user(format!("failed to load credentials {}: {e}", path.display()))
            })?,
            None => CredentialSet::default(),
        };

        let options = BuildOptions {
            pull: self.pull.map(PullPolicy::from).or(config.pull).unwrap_or_default(),
            allow_anonymous_pull: !self.no_anonymous_pull
                && config.allow_anonymous_pull.unwrap_or(true),
            codec: self.codec.map(Codec::from).or(config.codec).unwrap_or_default(),
            keep_failed: self.keep_failed || config.keep_failed.unwrap_or(false),
        };

        Ok(BuildRequest {
            output_dir: self
                .output_dir
                .or(config.output_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            url_base: required(
                self.url_base.or(config.url_base),
                "url_base",
                "--url-base",
                "BALE_URLBASE",
            )?,
            private_key: required(
                self.private_key.or(config.private_key),
                "private_key",
                "--private-key",
                "BALE_PRIVATEKEY",
            )?,
            author: required(
                self.author.or(config.author),
                "author",
                "--author",
                "BALE_AUTHOR",
            )?,
            images,
            credentials,
            options,
        })
    }
}

fn open_runtime(name: &str, endpoint: Option<&str>) -> Result<Box<dyn ContainerRuntime>, CliError> {
    let runtime = select_runtime(name, endpoint).map_err(|e| {
        if e.is_user_error() {
            CliError::user(format!("runtime error: {e}"))
        } else {
            CliError::system(format!("runtime error: {e}"))
        }
    })?;
    runtime
        .ping()
        .map_err(|e| CliError::system(format!("runtime '{name}' is not reachable: {e}")))?;
    Ok(runtime)
}

fn committed_json(pkg: &CommittedPackage) -> serde_json::Value {
    serde_json::json!({
        "id": pkg.id.as_str(),
        "package_dir": pkg.package_dir,
        "manifest": pkg.manifest_file,
        "signature": pkg.signature_file,
        "parts": pkg.parts,
    })
}

pub fn run(args: CreateArgs, json: bool) -> Result<u8, CliError> {
    let config = match &args.config {
        Some(path) => parse_config_file(path)
            .map_err(|e| CliError::user(format!("config error in {}: {e}", path.display())))?,
        None => BuildConfig::default(),
    };
    let runtime_name = args.runtime.clone();
    let endpoint = args.docker_endpoint.clone();
    let request = args.into_request(config)?;
    debug!(
        "building {} image(s) into {}",
        request.images.len(),
        request.output_dir.display()
    );

    let runtime = open_runtime(&runtime_name, endpoint.as_deref())?;
    let reporter = Arc::new(Reporter::stdio());
    let mut orchestrator = Orchestrator::new(runtime, Arc::clone(&reporter))?;

    match orchestrator.build(&request)? {
        BuildOutcome::Committed(pkg) => {
            if json {
                reporter.result_line(&json_pretty(&committed_json(&pkg))?);
            } else {
                reporter.result_line(&format!(
                    "{} {} {}",
                    pkg.package_dir.display(),
                    pkg.manifest_file.display(),
                    pkg.signature_file.display()
                ));
            }
            Ok(EXIT_SUCCESS)
        }
        BuildOutcome::Aborted(summary) => {
            reporter.error(&format!(
                "Package {} aborted after {} error(s)",
                summary.id, summary.errors
            ));
            Ok(if summary.is_user_error() {
                EXIT_USER_ERROR
            } else {
                EXIT_FAILURE
            })
        }
        BuildOutcome::InProgress => Err(CliError::system("build ended without an outcome")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: CreateArgs,
    }

    fn parse(argv: &[&str]) -> CreateArgs {
        let mut full = vec!["bale"];
        full.extend_from_slice(argv);
        Wrapper::try_parse_from(full).unwrap().args
    }

    #[test]
    fn flags_override_config() {
        let args = parse(&[
            "-i",
            "xy.io/a:1",
            "-u",
            "https://cdn.example.com",
            "-k",
            "/keys/p.pem",
            "-a",
            "flag@example.com",
            "--codec",
            "zstd",
        ]);
        let config = BuildConfig {
            author: Some("config@example.com".to_owned()),
            output_dir: Some(PathBuf::from("/srv/out")),
            images: vec!["config.io/ignored:1".to_owned()],
            codec: Some(Codec::Gzip),
            keep_failed: Some(true),
            ..BuildConfig::default()
        };
        let req = args.into_request(config).unwrap();
        assert_eq!(req.author, "flag@example.com");
        assert_eq!(req.images, ["xy.io/a:1"]);
        assert_eq!(req.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(req.options.codec, Codec::Zstd);
        assert!(req.options.keep_failed);
        assert!(req.options.allow_anonymous_pull);
    }

    #[test]
    fn config_supplies_missing_flags() {
        let args = parse(&[]);
        let config = BuildConfig {
            author: Some("ops@example.com".to_owned()),
            url_base: Some("https://cdn.example.com".to_owned()),
            private_key: Some(PathBuf::from("/keys/p.pem")),
            images: vec!["xy.io/a:1".to_owned(), "xy.io/b:1".to_owned()],
            pull: Some(PullPolicy::Always),
            allow_anonymous_pull: Some(false),
            ..BuildConfig::default()
        };
        let req = args.into_request(config).unwrap();
        assert_eq!(req.images.len(), 2);
        assert_eq!(req.output_dir, PathBuf::from("."));
        assert_eq!(req.options.pull, PullPolicy::Always);
        assert!(!req.options.allow_anonymous_pull);
    }

    #[test]
    fn missing_author_is_user_error() {
        let args = parse(&["-i", "xy.io/a:1", "-u", "https://x", "-k", "/k.pem"]);
        let err = args.into_request(BuildConfig::default()).unwrap_err();
        assert_eq!(err.code, EXIT_USER_ERROR);
        assert!(err.message.contains("author"));
    }

    #[test]
    fn no_images_is_user_error() {
        let args = parse(&["-u", "https://x", "-k", "/k.pem", "-a", "me"]);
        let err = args.into_request(BuildConfig::default()).unwrap_err();
        assert_eq!(err.code, EXIT_USER_ERROR);
    }

    #[test]
    fn comma_separated_images() {
        let args = parse(&["-i", "xy.io/a:1,xy.io/b:2", "-i", "xy.io/c:3"]);
        assert_eq!(args.images, ["xy.io/a:1", "xy.io/b:2", "xy.io/c:3"]);
    }

    #[test]
    fn unknown_runtime_is_user_error() {
        let err = open_runtime("containerd-nope", None).err().unwrap();
        assert_eq!(err.code, EXIT_USER_ERROR);
    }
}

mod commands;

use bale_core::install_signal_handler;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::create::CreateArgs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "bale",
    version,
    about = "Build signed, content-addressed packages from container images"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export, compress, and sign images into a new package.
    Create(CreateArgs),
    /// Check a package's signatures, sizes, and digests.
    Verify {
        /// Path to the package manifest (<id>.json).
        manifest: PathBuf,
        /// SPKI PEM Ed25519 public key the package was signed with.
        #[arg(short = 'p', long, env = "BALE_PUBLICKEY")]
        public_key: PathBuf,
    },
    /// Generate an Ed25519 signing key pair.
    Keygen {
        /// Directory the key pair is written to.
        #[arg(long, default_value = ".")]
        out: PathBuf,
        /// Overwrite existing key files.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages.
    ManPages {
        /// Directory to write man pages to.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BALE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Create(args) => {
            install_signal_handler();
            commands::create::run(args, json_output)
        }
        Commands::Verify {
            manifest,
            public_key,
        } => commands::verify::run(&manifest, &public_key, json_output),
        Commands::Keygen { out, force } => commands::keygen::run(&out, force, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.code)
        }
    }
}

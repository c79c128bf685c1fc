use super::{json_pretty, CliError, EXIT_SUCCESS, EXIT_VERIFY_FAILED};
use bale_core::{load_public_key_pem, verify_package};
use std::path::Path;

pub fn run(manifest: &Path, public_key: &Path, json: bool) -> Result<u8, CliError> {
    let key = load_public_key_pem(public_key).map_err(|e| CliError::user(e.to_string()))?;

    match verify_package(manifest, &key) {
        Ok(report) => {
            if json {
                let value = serde_json::json!({
                    "id": report.id.as_str(),
                    "package_dir": report.package_dir,
                    "parts": report.parts,
                    "stored_bytes": report.stored_bytes,
                    "verified": true,
                });
                println!("{}", json_pretty(&value)?);
            } else {
                println!(
                    "verified package {} ({} part(s), {} bytes)",
                    report.id, report.parts, report.stored_bytes
                );
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if json {
                let value = serde_json::json!({
                    "manifest": manifest,
                    "verified": false,
                    "error": e.to_string(),
                });
                println!("{}", json_pretty(&value)?);
            } else {
                eprintln!("verification failed: {e}");
            }
            Ok(EXIT_VERIFY_FAILED)
        }
    }
}

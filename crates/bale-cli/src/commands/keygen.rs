use super::{json_pretty, CliError, EXIT_SUCCESS};
use bale_store::{write_atomic, PUBLIC_FILE_MODE};
use ed25519_dalek::SigningKey;
use pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use std::fs;
use std::path::Path;

const PRIVATE_KEY_MODE: u32 = 0o600;

pub fn run(out: &Path, force: bool, json: bool) -> Result<u8, CliError> {
    fs::create_dir_all(out)
        .map_err(|e| CliError::user(format!("failed to create directory {}: {e}", out.display())))?;

    let private_path = out.join("private_key.pem");
    let public_path = out.join("public_key.pem");
    if !force {
        for path in [&private_path, &public_path] {
            if path.exists() {
                return Err(CliError::user(format!(
                    "key already exists: {} (use --force to overwrite)",
                    path.display()
                )));
            }
        }
    }

    let signing_key = SigningKey::generate(&mut rand::thread_rng());
    let private_pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CliError::system(format!("failed to encode private key: {e}")))?;
    let public_pem = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CliError::system(format!("failed to encode public key: {e}")))?;

    write_atomic(&private_path, private_pem.as_bytes(), PRIVATE_KEY_MODE)
        .map_err(|e| CliError::system(e.to_string()))?;
    write_atomic(&public_path, public_pem.as_bytes(), PUBLIC_FILE_MODE)
        .map_err(|e| CliError::system(e.to_string()))?;

    if json {
        let value = serde_json::json!({
            "private_key": private_path,
            "public_key": public_path,
        });
        println!("{}", json_pretty(&value)?);
    } else {
        println!("private key: {}", private_path.display());
        println!("public key:  {}", public_path.display());
    }
    Ok(EXIT_SUCCESS)
}

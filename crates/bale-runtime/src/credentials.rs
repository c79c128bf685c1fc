use crate::RuntimeError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Username/password pair for one registry server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub server_address: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// The `auth` field of a docker `config.json` entry for this credential.
    pub fn encoded_auth(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DockerAuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

/// Registry credentials keyed by server address.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    entries: Vec<Credential>,
}

impl CredentialSet {
    pub fn new(entries: Vec<Credential>) -> Self {
        Self { entries }
    }

    /// Load the `auths` section of a docker-style `config.json`.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::InvalidCredentials(format!("{}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, RuntimeError> {
        let file: DockerConfigFile = serde_json::from_str(content)
            .map_err(|e| RuntimeError::InvalidCredentials(e.to_string()))?;

        let mut entries = Vec::with_capacity(file.auths.len());
        for (server, entry) in file.auths {
            let (username, password) = match (entry.username, entry.password, entry.auth) {
                (Some(u), Some(p), _) => (u, p),
                (_, _, Some(auth)) => decode_auth(&server, &auth)?,
                _ => {
                    return Err(RuntimeError::InvalidCredentials(format!(
                        "entry for '{server}' has neither auth nor username/password"
                    )))
                }
            };
            entries.push(Credential {
                server_address: normalize_server(&server).to_owned(),
                username,
                password,
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, server_address: &str) -> Option<&Credential> {
        let wanted = normalize_server(server_address);
        self.entries
            .iter()
            .find(|c| normalize_server(&c.server_address) == wanted)
    }
}

/// Render a minimal `config.json` that holds exactly one credential.
pub(crate) fn single_entry_config(credential: &Credential) -> Result<String, RuntimeError> {
    let mut auths = BTreeMap::new();
    auths.insert(
        credential.server_address.clone(),
        DockerAuthEntry {
            auth: Some(credential.encoded_auth()),
            username: None,
            password: None,
        },
    );
    serde_json::to_string(&DockerConfigFile { auths })
        .map_err(|e| RuntimeError::ExecFailed(format!("credential encoding failed: {e}")))
}

fn decode_auth(server: &str, auth: &str) -> Result<(String, String), RuntimeError> {
    let raw = BASE64
        .decode(auth.trim())
        .map_err(|e| RuntimeError::InvalidCredentials(format!("'{server}': {e}")))?;
    let text = String::from_utf8(raw)
        .map_err(|e| RuntimeError::InvalidCredentials(format!("'{server}': {e}")))?;
    let (user, pass) = text.split_once(':').ok_or_else(|| {
        RuntimeError::InvalidCredentials(format!("'{server}': auth is not user:password"))
    })?;
    Ok((user.to_owned(), pass.to_owned()))
}

/// `https://xy.io/v1/` and `xy.io` name the same server.
fn normalize_server(server: &str) -> &str {
    let s = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    s.split('/').next().unwrap_or(s)
}

//! The `agent.key` credential file.
//!
//! Written once on successful enrollment, read on every agent startup.
//! Lives in the agent's config directory as two `KEY=value` lines:
//!
//! ```text
//! AGENT_ID=7
//! API_KEY=3f1c...
//! ```
//!
//! The directory is created mode 0700 and the file mode 0600 so the
//! bearer key is not readable by other local users.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const AGENT_ID_KEY: &str = "AGENT_ID";
const API_KEY_KEY: &str = "API_KEY";

/// The two credentials an enrolled agent needs to reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCredentials {
    pub agent_id: u64,
    pub api_key: String,
}

#[derive(Debug)]
pub enum CredentialsError {
    Io(io::Error),
    Missing(&'static str),
    Malformed(String),
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "credential file I/O error: {e}"),
            Self::Missing(field) => write!(f, "credential file missing {field}"),
            Self::Malformed(line) => write!(f, "credential file has malformed line: {line}"),
        }
    }
}

impl std::error::Error for CredentialsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CredentialsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Write `agent.key` into `config_dir`, creating the directory (mode 0700
/// on unix) if it does not already exist. Overwrites any existing file.
pub fn write_credentials(
    config_dir: &Path,
    credentials: &AgentCredentials,
) -> Result<(), CredentialsError> {
    fs::create_dir_all(config_dir)?;
    #[cfg(unix)]
    fs::set_permissions(config_dir, fs::Permissions::from_mode(0o700))?;

    let path = config_dir.join("agent.key");
    let contents = format!(
        "{AGENT_ID_KEY}={}\n{API_KEY_KEY}={}\n",
        credentials.agent_id, credentials.api_key
    );
    fs::write(&path, contents)?;
    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Read and parse `agent.key` from `config_dir`.
///
/// Tolerant of blank lines and reversed line ordering. A value containing
/// `=` is preserved verbatim (only the first `=` splits key from value).
pub fn read_credentials(config_dir: &Path) -> Result<AgentCredentials, CredentialsError> {
    let path = config_dir.join("agent.key");
    let raw = fs::read_to_string(&path)?;
    parse_credentials(&raw)
}

fn parse_credentials(raw: &str) -> Result<AgentCredentials, CredentialsError> {
    let mut agent_id: Option<u64> = None;
    let mut api_key: Option<String> = None;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| CredentialsError::Malformed(line.to_string()))?;
        match key.trim() {
            AGENT_ID_KEY => {
                agent_id = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| CredentialsError::Malformed(line.to_string()))?,
                );
            }
            API_KEY_KEY => api_key = Some(value.trim().to_string()),
            _ => continue,
        }
    }

    Ok(AgentCredentials {
        agent_id: agent_id.ok_or(CredentialsError::Missing(AGENT_ID_KEY))?,
        api_key: api_key.ok_or(CredentialsError::Missing(API_KEY_KEY))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("agent-config");
        let creds = AgentCredentials {
            agent_id: 7,
            api_key: "3f1c9a...".to_string(),
        };

        write_credentials(&config_dir, &creds).unwrap();
        let read_back = read_credentials(&config_dir).unwrap();
        assert_eq!(read_back, creds);
    }

    #[cfg(unix)]
    #[test]
    fn sets_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("agent-config");
        let creds = AgentCredentials {
            agent_id: 1,
            api_key: "key".to_string(),
        };
        write_credentials(&config_dir, &creds).unwrap();

        let dir_mode = fs::metadata(&config_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        let file_mode = fs::metadata(config_dir.join("agent.key"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn tolerates_blank_lines_and_reversed_order() {
        let raw = "\nAPI_KEY=abc\n\nAGENT_ID=9\n";
        let creds = parse_credentials(raw).unwrap();
        assert_eq!(creds.agent_id, 9);
        assert_eq!(creds.api_key, "abc");
    }

    #[test]
    fn preserves_equals_signs_in_value() {
        let raw = "AGENT_ID=1\nAPI_KEY=a=b=c\n";
        let creds = parse_credentials(raw).unwrap();
        assert_eq!(creds.api_key, "a=b=c");
    }

    #[test]
    fn missing_field_is_an_error() {
        let raw = "AGENT_ID=1\n";
        assert!(matches!(
            parse_credentials(raw),
            Err(CredentialsError::Missing(API_KEY_KEY))
        ));
    }
}

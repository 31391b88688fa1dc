//! Secret storage using the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Only the cloud
//! mirror's anon key lives here; everything else is in `config.json`.

use keyring::Entry;
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::error::{PosError, PosResult};

const SERVICE_NAME: &str = "buffet-pos";

pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";

const ENV_SUPABASE_URL: &str = "SUPABASE_URL";
const ENV_SUPABASE_ANON_KEY: &str = "SUPABASE_ANON_KEY";

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> PosResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Config(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| PosError::Config(e.to_string()))?;
    info!(key, "credential stored");
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> PosResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Config(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(PosError::Config(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Cloud credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CloudCredentials {
    pub url: String,
    pub anon_key: String,
}

/// Resolve the cloud endpoint: URL from config then `SUPABASE_URL`, key from
/// the keyring then `SUPABASE_ANON_KEY`.
pub fn cloud_credentials(cfg: &DeviceConfig) -> Option<CloudCredentials> {
    resolve_cloud_credentials(cfg, get_credential, |name| std::env::var(name).ok())
}

fn resolve_cloud_credentials(
    cfg: &DeviceConfig,
    keyring_get: impl Fn(&str) -> Option<String>,
    env_get: impl Fn(&str) -> Option<String>,
) -> Option<CloudCredentials> {
    let non_empty = |s: String| {
        let t = s.trim().to_string();
        (!t.is_empty()).then_some(t)
    };
    let url = cfg
        .supabase_url
        .clone()
        .and_then(non_empty)
        .or_else(|| env_get(ENV_SUPABASE_URL).and_then(non_empty))?;
    let anon_key = keyring_get(KEY_SUPABASE_ANON_KEY)
        .and_then(non_empty)
        .or_else(|| env_get(ENV_SUPABASE_ANON_KEY).and_then(non_empty))?;
    Some(CloudCredentials {
        url: url.trim_end_matches('/').to_string(),
        anon_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_url(url: Option<&str>) -> DeviceConfig {
        DeviceConfig {
            supabase_url: url.map(str::to_string),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_keyring_key_wins_over_env() {
        let creds = resolve_cloud_credentials(
            &cfg_with_url(Some("https://club.supabase.co/")),
            |_| Some("from-keyring".into()),
            |_| Some("from-env".into()),
        )
        .unwrap();
        assert_eq!(creds.url, "https://club.supabase.co");
        assert_eq!(creds.anon_key, "from-keyring");
    }

    #[test]
    fn test_env_fallback_for_url_and_key() {
        let creds = resolve_cloud_credentials(
            &cfg_with_url(None),
            |_| None,
            |name| match name {
                ENV_SUPABASE_URL => Some("https://env.supabase.co".into()),
                ENV_SUPABASE_ANON_KEY => Some("env-key".into()),
                _ => None,
            },
        )
        .unwrap();
        assert_eq!(creds.url, "https://env.supabase.co");
        assert_eq!(creds.anon_key, "env-key");
    }

    #[test]
    fn test_missing_key_means_unconfigured() {
        let creds = resolve_cloud_credentials(
            &cfg_with_url(Some("https://club.supabase.co")),
            |_| Some("   ".into()),
            |_| None,
        );
        assert!(creds.is_none());
    }
}

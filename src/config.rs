use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::upload::security::{self, UploadSecurityConfig};

/// Runtime configuration, assembled once at startup from the environment
/// (the launcher exports its CLI flags as `GASOLINE_*` variables).
/// Immutable afterwards; every component receives what it needs at
/// construction instead of reading globals.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listen port on loopback.
    pub port: u16,
    /// Capacity of each telemetry ring buffer.
    pub max_log_entries: usize,
    /// Shared secret for `X-Gasoline-Key`. `None` disables the check.
    pub api_key: Option<String>,
    /// Chrome extension id pinned by `GASOLINE_EXTENSION_ID`.
    pub extension_id: Option<String>,
    /// Firefox extension id pinned by `GASOLINE_FIREFOX_EXTENSION_ID`.
    pub firefox_extension_id: Option<String>,
    /// Root for persisted state (JSONL logs, recordings, macros).
    pub state_dir: PathBuf,
    /// Scoped directory for Stage 2-4 uploads, pre-validated.
    pub upload_dir: Option<PathBuf>,
    /// User-supplied glob patterns always denied for uploads.
    pub upload_deny_patterns: Vec<String>,
    /// Hosts exempt from SSRF resolution checks (test harnesses only).
    pub ssrf_allow_hosts: Vec<String>,
    /// Gate for Stage 4 OS-level automation.
    pub os_automation_enabled: bool,
    /// Structured warnings accumulated during startup, surfaced in /health.
    pub startup_warnings: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut warnings = Vec::new();

        let port = match parse_optional_u64("GASOLINE_PORT")? {
            Some(p) if (1..=65535).contains(&p) => p as u16,
            Some(p) => return Err(anyhow!("GASOLINE_PORT {} out of range 1-65535", p)),
            None => 9223,
        };
        let max_log_entries = parse_optional_u64("GASOLINE_MAX_LOG_ENTRIES")?
            .map(|v| v as usize)
            .unwrap_or(1000);

        let api_key = env::var("GASOLINE_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warnings.push(
                "no API key configured; any local process may drive this daemon".to_string(),
            );
        }

        let extension_id = non_empty_var("GASOLINE_EXTENSION_ID");
        let firefox_extension_id = non_empty_var("GASOLINE_FIREFOX_EXTENSION_ID");

        let state_dir = match non_empty_var("GASOLINE_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".gasoline"),
        };
        if let Err(e) = std::fs::create_dir_all(&state_dir) {
            warnings.push(format!(
                "state dir {} is not writable ({}); persistence disabled",
                state_dir.display(),
                e
            ));
        }

        let upload_deny_patterns = list_var("GASOLINE_UPLOAD_DENY");
        let ssrf_allow_hosts = list_var("GASOLINE_SSRF_ALLOW_HOSTS");
        if !ssrf_allow_hosts.is_empty() {
            warnings.push(format!(
                "SSRF allow list active ({}); intended for tests only",
                ssrf_allow_hosts.join(", ")
            ));
        }

        let upload_dir = match non_empty_var("GASOLINE_UPLOAD_DIR") {
            Some(raw) => match security::validate_upload_dir(Path::new(&raw)) {
                Ok(dir) => Some(dir),
                Err(reason) => {
                    warnings.push(format!(
                        "upload dir {:?} rejected ({}); staged uploads disabled",
                        raw, reason
                    ));
                    None
                }
            },
            None => None,
        };

        let os_automation_enabled =
            parse_bool_env("GASOLINE_ENABLE_OS_AUTOMATION")?.unwrap_or(false);

        for w in &warnings {
            tracing::warn!(warning = %w, "startup warning");
        }

        Ok(Self {
            port,
            max_log_entries,
            api_key,
            extension_id,
            firefox_extension_id,
            state_dir,
            upload_dir,
            upload_deny_patterns,
            ssrf_allow_hosts,
            os_automation_enabled,
            startup_warnings: warnings,
        })
    }

    /// Derive the immutable upload-security view handed to the pipeline.
    pub fn upload_security(&self) -> Result<UploadSecurityConfig> {
        UploadSecurityConfig::new(
            self.upload_dir.clone(),
            &self.upload_deny_patterns,
            self.ssrf_allow_hosts.clone(),
            dirs::home_dir(),
        )
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.state_dir.join("logs").join("gasoline.jsonl")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.state_dir.join("recordings")
    }

    /// Older builds wrote recordings here; read, never write.
    pub fn legacy_recordings_dir(&self) -> PathBuf {
        self.state_dir.join("recordings-legacy")
    }

    pub fn macros_path(&self) -> PathBuf {
        self.state_dir.join("macros.json")
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn list_var(var: &str) -> Vec<String> {
    env::var(var)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_VARS: [&str; 10] = [
        "GASOLINE_PORT",
        "GASOLINE_MAX_LOG_ENTRIES",
        "GASOLINE_API_KEY",
        "GASOLINE_EXTENSION_ID",
        "GASOLINE_FIREFOX_EXTENSION_ID",
        "GASOLINE_STATE_DIR",
        "GASOLINE_UPLOAD_DIR",
        "GASOLINE_UPLOAD_DENY",
        "GASOLINE_SSRF_ALLOW_HOSTS",
        "GASOLINE_ENABLE_OS_AUTOMATION",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("GASOLINE_STATE_DIR", tmp.path());

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 9223);
        assert_eq!(cfg.max_log_entries, 1000);
        assert!(cfg.api_key.is_none());
        assert!(cfg.upload_dir.is_none());
        assert!(!cfg.os_automation_enabled);
        // Missing key is called out, not silently accepted.
        assert!(cfg
            .startup_warnings
            .iter()
            .any(|w| w.contains("API key")));
        clear_env();
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let state = tempfile::tempdir().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        std::env::set_var("GASOLINE_PORT", "4020");
        std::env::set_var("GASOLINE_MAX_LOG_ENTRIES", "250");
        std::env::set_var("GASOLINE_API_KEY", "secret123");
        std::env::set_var("GASOLINE_EXTENSION_ID", "abcdefghij");
        std::env::set_var("GASOLINE_STATE_DIR", state.path());
        std::env::set_var("GASOLINE_UPLOAD_DIR", uploads.path());
        std::env::set_var("GASOLINE_UPLOAD_DENY", "*.bak, *.tmp");
        std::env::set_var("GASOLINE_SSRF_ALLOW_HOSTS", "127.0.0.1");
        std::env::set_var("GASOLINE_ENABLE_OS_AUTOMATION", "true");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 4020);
        assert_eq!(cfg.max_log_entries, 250);
        assert_eq!(cfg.api_key.as_deref(), Some("secret123"));
        assert_eq!(cfg.extension_id.as_deref(), Some("abcdefghij"));
        assert_eq!(
            cfg.upload_dir.as_deref().unwrap(),
            uploads.path().canonicalize().unwrap()
        );
        assert_eq!(cfg.upload_deny_patterns, vec!["*.bak", "*.tmp"]);
        assert_eq!(cfg.ssrf_allow_hosts, vec!["127.0.0.1"]);
        assert!(cfg.os_automation_enabled);
        clear_env();
    }

    #[test]
    fn rejects_out_of_range_port() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("GASOLINE_PORT", "70000");
        assert!(AppConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn bad_upload_dir_becomes_warning_not_error() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let state = tempfile::tempdir().unwrap();
        std::env::set_var("GASOLINE_STATE_DIR", state.path());
        std::env::set_var("GASOLINE_UPLOAD_DIR", "relative/dir");
        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.upload_dir.is_none());
        assert!(cfg
            .startup_warnings
            .iter()
            .any(|w| w.contains("upload dir")));
        clear_env();
    }
}

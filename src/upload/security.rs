//! Security pipeline for staged file uploads.
//!
//! A raw path must pass every check, in order, before any file I/O:
//! lexical clean, absolute check, full symlink resolution, the built-in
//! denylist, the user glob denylist, the scoped upload-directory check
//! (when the stage requires it) and the Unix hardlink refusal. URL and
//! header validation for the form-submit stage live here too, so the
//! stage handlers stay thin.

use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::net::lookup_host;
use url::{Host, Url};

use crate::errors::ToolError;

/// A path that survived the full pipeline. `resolved` is canonical,
/// absolute and symlink-free.
#[derive(Debug, Clone)]
pub struct ValidatedPath {
    pub raw: String,
    pub resolved: PathBuf,
}

/// Immutable security settings, owned by the composition root and handed
/// to each stage at construction. Test doubles are just alternate values.
#[derive(Debug, Clone)]
pub struct UploadSecurityConfig {
    pub upload_dir: Option<PathBuf>,
    deny_globs: GlobSet,
    deny_patterns: Vec<String>,
    ssrf_allow_hosts: Vec<String>,
    home: Option<PathBuf>,
}

impl UploadSecurityConfig {
    pub fn new(
        upload_dir: Option<PathBuf>,
        deny_patterns: &[String],
        ssrf_allow_hosts: Vec<String>,
        home: Option<PathBuf>,
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pat in deny_patterns {
            let glob = Glob::new(pat).map_err(|e| anyhow!("bad deny pattern {pat:?}: {e}"))?;
            builder.add(glob);
        }
        Ok(UploadSecurityConfig {
            upload_dir,
            deny_globs: builder.build()?,
            deny_patterns: deny_patterns.to_vec(),
            ssrf_allow_hosts,
            home,
        })
    }

    pub fn upload_dir_display(&self) -> Option<String> {
        self.upload_dir.as_ref().map(|d| d.display().to_string())
    }

    fn path_denied(&self, pattern: impl Into<String>) -> ToolError {
        ToolError::PathDenied {
            pattern: pattern.into(),
            upload_dir: self.upload_dir_display(),
        }
    }
}

/// Lexically normalize a path: strip `.`, resolve `..` against the stack,
/// collapse separators. Purely textual; no filesystem access.
pub fn clean_path(raw: &str) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for comp in Path::new(raw).components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Built-in denylist rules applied to the *resolved* path.
enum DenyRule {
    Prefix(PathBuf, &'static str),
    Exact(PathBuf, &'static str),
    Extension(&'static str),
    BasenamePrefix(&'static str),
    Suffix(&'static str),
}

fn builtin_deny_rules(home: Option<&Path>) -> Vec<DenyRule> {
    let mut rules = Vec::new();
    if let Some(home) = home {
        for rel in [
            ".ssh",
            ".gnupg",
            ".aws",
            ".azure",
            ".kube",
            ".config/gcloud",
            ".docker/config.json",
            ".config/gh/hosts.yml",
        ] {
            rules.push(DenyRule::Prefix(home.join(rel), "home credential store"));
        }
        for rel in [
            ".bash_history",
            ".zsh_history",
            ".sh_history",
            ".npmrc",
            ".pypirc",
        ] {
            rules.push(DenyRule::Exact(home.join(rel), "home secret file"));
        }
        // Browser profiles hold cookies and saved credentials.
        for rel in [
            ".mozilla/firefox",
            ".config/google-chrome",
            ".config/chromium",
            "Library/Application Support/Google/Chrome",
            "Library/Application Support/Firefox",
            "AppData/Local/Google/Chrome/User Data",
            "AppData/Roaming/Mozilla/Firefox",
        ] {
            rules.push(DenyRule::Prefix(home.join(rel), "browser profile"));
        }
    }
    for abs in [
        "/etc/shadow",
        "/etc/passwd",
        "/etc/sudoers",
        "/root/.ssh",
        "/root/.aws",
        "/root/.gnupg",
        "/root/.kube",
        "/root/.docker",
        "/Library/Keychains",
        "C:\\Windows\\System32\\config",
        "C:\\Windows\\System32\\drivers\\etc",
    ] {
        rules.push(DenyRule::Prefix(PathBuf::from(abs), "system path"));
    }
    for dir in ["/proc", "/sys"] {
        rules.push(DenyRule::Prefix(PathBuf::from(dir), "kernel filesystem"));
    }
    for ext in ["pem", "key", "p12", "pfx", "keystore"] {
        rules.push(DenyRule::Extension(ext));
    }
    rules.push(DenyRule::BasenamePrefix(".env"));
    rules.push(DenyRule::Suffix(".git/config"));
    rules
}

fn check_builtin_denylist(cfg: &UploadSecurityConfig, resolved: &Path) -> Result<(), ToolError> {
    for rule in builtin_deny_rules(cfg.home.as_deref()) {
        match rule {
            DenyRule::Prefix(prefix, _label) => {
                if resolved.starts_with(&prefix) {
                    return Err(cfg.path_denied(prefix.display().to_string()));
                }
            }
            DenyRule::Exact(path, _label) => {
                if resolved == path {
                    return Err(cfg.path_denied(path.display().to_string()));
                }
            }
            DenyRule::Extension(ext) => {
                if resolved
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext))
                {
                    return Err(cfg.path_denied(format!("*.{ext}")));
                }
            }
            DenyRule::BasenamePrefix(prefix) => {
                if resolved
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix))
                {
                    return Err(cfg.path_denied(format!("{prefix}*")));
                }
            }
            DenyRule::Suffix(suffix) => {
                if resolved.to_string_lossy().ends_with(suffix) {
                    return Err(cfg.path_denied(suffix));
                }
            }
        }
    }
    Ok(())
}

fn check_user_denylist(cfg: &UploadSecurityConfig, resolved: &Path) -> Result<(), ToolError> {
    if cfg.deny_patterns.is_empty() {
        return Ok(());
    }
    if cfg.deny_globs.is_match(resolved) {
        return Err(cfg.path_denied(matched_pattern(cfg, resolved)));
    }
    if let Some(name) = resolved.file_name() {
        if cfg.deny_globs.is_match(Path::new(name)) {
            return Err(cfg.path_denied(matched_pattern(cfg, Path::new(name))));
        }
    }
    Ok(())
}

fn matched_pattern(cfg: &UploadSecurityConfig, path: &Path) -> String {
    cfg.deny_globs
        .matches(path)
        .first()
        .and_then(|i| cfg.deny_patterns.get(*i))
        .cloned()
        .unwrap_or_else(|| "user denylist".to_string())
}

/// Case handling for the containment check follows the dominant
/// filesystem semantics per platform.
fn paths_contain(dir: &Path, candidate: &Path) -> bool {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        let dir = dir.to_string_lossy().to_lowercase();
        let cand = candidate.to_string_lossy().to_lowercase();
        Path::new(&cand).starts_with(Path::new(&dir))
    } else {
        candidate.starts_with(dir)
    }
}

/// Run the full path pipeline. `require_upload_dir` enforces the scoped
/// directory containment used by stages 2-4.
pub fn validate_path(
    cfg: &UploadSecurityConfig,
    raw: &str,
    require_upload_dir: bool,
) -> Result<ValidatedPath, ToolError> {
    if raw.trim().is_empty() {
        return Err(ToolError::MissingParam("file_path".into()));
    }
    let cleaned = clean_path(raw);
    if !cleaned.is_absolute() {
        return Err(ToolError::InvalidParam {
            param: "file_path".into(),
            reason: format!("path must be absolute, got {raw:?}"),
        });
    }
    // canonicalize resolves every symlink in the chain, repeating as
    // needed; failure means a dangling link or missing component.
    let resolved = std::fs::canonicalize(&cleaned).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ToolError::PermissionDenied(cleaned.display().to_string())
        }
        _ => ToolError::NotFound(cleaned.display().to_string()),
    })?;

    check_builtin_denylist(cfg, &resolved)?;
    check_user_denylist(cfg, &resolved)?;

    if require_upload_dir {
        let dir = cfg
            .upload_dir
            .as_ref()
            .ok_or(ToolError::UploadDirRequired)?;
        if !paths_contain(dir, &resolved) {
            return Err(cfg.path_denied(format!("outside upload dir {}", dir.display())));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::symlink_metadata(&resolved)
            .map_err(|_| ToolError::NotFound(resolved.display().to_string()))?;
        if meta.is_file() && meta.nlink() > 1 {
            return Err(cfg.path_denied("hardlinked file"));
        }
    }

    Ok(ValidatedPath {
        raw: raw.to_string(),
        resolved,
    })
}

/// Startup validation of the `--upload-dir` argument. Errors here are
/// plain strings because they land in startup warnings, not tool errors.
pub fn validate_upload_dir(raw: &Path) -> std::result::Result<PathBuf, String> {
    if !raw.is_absolute() {
        return Err("must be an absolute path".into());
    }
    let meta = std::fs::symlink_metadata(raw).map_err(|e| format!("unreadable: {e}"))?;
    if meta.file_type().is_symlink() {
        return Err("must not be a symlink".into());
    }
    if !meta.is_dir() {
        return Err("must be a directory".into());
    }
    let resolved = std::fs::canonicalize(raw).map_err(|e| format!("unresolvable: {e}"))?;
    if resolved == Path::new("/") {
        return Err("must not be the filesystem root".into());
    }
    if let Some(home) = dirs::home_dir() {
        if resolved == home {
            return Err("must not be the home directory itself".into());
        }
    }
    let probe = UploadSecurityConfig::new(None, &[], Vec::new(), dirs::home_dir())
        .map_err(|e| e.to_string())?;
    if check_builtin_denylist(&probe, &resolved).is_err() {
        return Err("lies inside a protected location".into());
    }
    Ok(resolved)
}

fn ip_is_public(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // CGNAT 100.64.0.0/10 is not routable either.
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ip_is_public(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                // ULA fc00::/7
                || (seg[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (seg[0] & 0xffc0) == 0xfe80)
        }
    }
}

/// Hostnames rejected before DNS is even consulted.
fn hostname_blocked(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".localhost")
        || lower == "metadata.google.internal"
}

/// Validate a form-submit target URL against the SSRF policy. DNS
/// failures are fail-closed; every resolved address must be public.
pub async fn validate_url(cfg: &UploadSecurityConfig, raw: &str) -> Result<Url, ToolError> {
    let url = Url::parse(raw).map_err(|e| ToolError::InvalidParam {
        param: "url".into(),
        reason: format!("{raw:?}: {e}"),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ToolError::InvalidParam {
                param: "url".into(),
                reason: format!("scheme {other:?} is not allowed"),
            })
        }
    }
    let host = url
        .host()
        .ok_or_else(|| ToolError::InvalidParam {
            param: "url".into(),
            reason: "missing host".into(),
        })?
        .to_owned();
    let host_str = match &host {
        Host::Domain(d) => d.to_string(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    if cfg.ssrf_allow_hosts.iter().any(|h| h == &host_str) {
        return Ok(url);
    }
    match host {
        Host::Ipv4(ip) => {
            if !ip_is_public(IpAddr::V4(ip)) {
                return Err(ToolError::SsrfBlocked(format!("literal address {ip}")));
            }
        }
        Host::Ipv6(ip) => {
            if !ip_is_public(IpAddr::V6(ip)) {
                return Err(ToolError::SsrfBlocked(format!("literal address {ip}")));
            }
        }
        Host::Domain(domain) => {
            if hostname_blocked(&domain) {
                return Err(ToolError::SsrfBlocked(format!("hostname {domain}")));
            }
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs: Vec<_> = lookup_host((domain.as_str(), port))
                .await
                .map_err(|e| ToolError::SsrfBlocked(format!("DNS failure for {domain}: {e}")))?
                .collect();
            if addrs.is_empty() {
                return Err(ToolError::SsrfBlocked(format!("{domain} resolved to nothing")));
            }
            for addr in addrs {
                if !ip_is_public(addr.ip()) {
                    return Err(ToolError::SsrfBlocked(format!(
                        "{domain} resolves to non-public {}",
                        addr.ip()
                    )));
                }
            }
        }
    }
    Ok(url)
}

/// Methods permitted for the form-submit stage.
pub fn validate_method(raw: &str) -> Result<reqwest::Method, ToolError> {
    match raw.to_ascii_uppercase().as_str() {
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "PATCH" => Ok(reqwest::Method::PATCH),
        other => Err(ToolError::InvalidParam {
            param: "method".into(),
            reason: format!("{other} not in POST/PUT/PATCH"),
        }),
    }
}

/// Reject cookie values that could smuggle extra headers.
pub fn validate_cookie_header(cookie: &str) -> Result<(), ToolError> {
    let bytes = cookie.as_bytes();
    if memchr::memchr3(b'\r', b'\n', b'\0', bytes).is_some() {
        return Err(ToolError::HeaderInjection("cookie header".into()));
    }
    Ok(())
}

/// Sanitize a filename or input name destined for Content-Disposition.
pub fn sanitize_disposition(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '"' | '\n' | '\r' | '\0' => '_',
            other => other,
        })
        .collect()
}

/// Stage 4 hands the path to a shell-adjacent automation layer, so the
/// character rules are stricter than the general pipeline.
pub fn validate_automation_path(raw: &str) -> Result<(), ToolError> {
    if raw
        .bytes()
        .any(|b| b == b'\0' || b == b'\r' || b == b'\n' || b == b'`')
    {
        return Err(ToolError::InvalidParam {
            param: "file_path".into(),
            reason: "path contains control characters or backticks".into(),
        });
    }
    Ok(())
}

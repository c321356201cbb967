//! OS-level browser automation for the last upload stage.
//!
//! Everything platform-specific hides behind [`BrowserAutomation`] so the
//! escalation machinery and the HTTP surface stay portable, and tests can
//! substitute a scripted double instead of monkey-patching anything.

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::ToolError;

#[async_trait]
pub trait BrowserAutomation: Send + Sync {
    /// Find a running browser process id, used when the caller passes 0.
    async fn detect_browser_pid(&self) -> Result<u32, ToolError>;
    /// Type `path` into the browser's native file dialog and confirm it.
    async fn inject_path(&self, pid: u32, path: &str) -> Result<(), ToolError>;
    /// Dismiss an open file dialog without selecting anything.
    async fn dismiss_dialog(&self, pid: u32) -> Result<(), ToolError>;
}

const BROWSER_PROCESS_NAMES: [&str; 6] = [
    "chrome",
    "chromium",
    "google-chrome",
    "firefox",
    "brave",
    "msedge",
];

/// Production implementation shelling out to the platform's automation
/// tooling: AppleScript on macOS, xdotool on Linux, SendKeys via
/// PowerShell on Windows.
pub struct NativeAutomation;

#[async_trait]
impl BrowserAutomation for NativeAutomation {
    async fn detect_browser_pid(&self) -> Result<u32, ToolError> {
        if cfg!(target_os = "macos") || cfg!(target_os = "linux") {
            for name in BROWSER_PROCESS_NAMES {
                if let Some(pid) = pgrep_first(name).await {
                    return Ok(pid);
                }
            }
            if cfg!(target_os = "linux") {
                if let Some(pid) = ps_scan().await {
                    return Ok(pid);
                }
            }
            Err(ToolError::PidNotFound(
                "no running browser matched; pass browser_pid explicitly".into(),
            ))
        } else {
            Err(ToolError::UnsupportedOs(format!(
                "PID auto-detect not implemented on {}",
                std::env::consts::OS
            )))
        }
    }

    async fn inject_path(&self, pid: u32, path: &str) -> Result<(), ToolError> {
        if pid == 0 {
            return Err(ToolError::PidNotFound("browser_pid must be positive".into()));
        }
        #[cfg(target_os = "macos")]
        {
            let script = applescript_inject(path);
            run_tool("osascript", &["-e", &script]).await
        }
        #[cfg(target_os = "linux")]
        {
            // Slash opens the location bar in GTK file choosers.
            run_tool("xdotool", &["key", "--clearmodifiers", "slash"]).await?;
            run_tool("xdotool", &["type", "--delay", "30", path]).await?;
            run_tool("xdotool", &["key", "--clearmodifiers", "Return"]).await
        }
        #[cfg(target_os = "windows")]
        {
            let script = powershell_sendkeys(&format!("{}{{ENTER}}", escape_sendkeys(path)));
            run_tool("powershell", &["-NoProfile", "-Command", &script]).await
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            let _ = path;
            Err(ToolError::UnsupportedOs(format!(
                "keystroke injection not implemented on {}",
                std::env::consts::OS
            )))
        }
    }

    async fn dismiss_dialog(&self, pid: u32) -> Result<(), ToolError> {
        if pid == 0 {
            return Err(ToolError::PidNotFound("browser_pid must be positive".into()));
        }
        #[cfg(target_os = "macos")]
        {
            run_tool(
                "osascript",
                &[
                    "-e",
                    "tell application \"System Events\" to key code 53",
                ],
            )
            .await
        }
        #[cfg(target_os = "linux")]
        {
            run_tool("xdotool", &["key", "--clearmodifiers", "Escape"]).await
        }
        #[cfg(target_os = "windows")]
        {
            let script = powershell_sendkeys("{ESC}");
            run_tool("powershell", &["-NoProfile", "-Command", &script]).await
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            Err(ToolError::UnsupportedOs(format!(
                "dialog dismissal not implemented on {}",
                std::env::consts::OS
            )))
        }
    }
}

async fn pgrep_first(name: &str) -> Option<u32> {
    let output = Command::new("pgrep")
        .arg("-f")
        .arg(name)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|l| l.trim().parse::<u32>().ok())
}

async fn ps_scan() -> Option<u32> {
    let output = Command::new("ps").args(["-eo", "pid,comm"]).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    for line in String::from_utf8_lossy(&output.stdout).lines().skip(1) {
        let mut parts = line.trim().split_whitespace();
        let pid = parts.next()?.parse::<u32>().ok();
        let comm = parts.next().unwrap_or("");
        if let Some(pid) = pid {
            if BROWSER_PROCESS_NAMES
                .iter()
                .any(|n| comm.to_ascii_lowercase().contains(n))
            {
                return Some(pid);
            }
        }
    }
    None
}

#[allow(dead_code)]
async fn run_tool(program: &str, args: &[&str]) -> Result<(), ToolError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::UnsupportedOs(format!(
                "{program} is not installed; Stage 4 requires it"
            )),
            _ => ToolError::Internal(format!("{program} failed to start: {e}")),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ToolError::Internal(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// AppleScript literal escaping: backslashes first, then quotes.
pub fn escape_applescript(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[allow(dead_code)]
fn applescript_inject(path: &str) -> String {
    let escaped = escape_applescript(path);
    format!(
        "tell application \"System Events\"\n\
         keystroke \"g\" using {{command down, shift down}}\n\
         delay 0.3\n\
         keystroke \"{escaped}\"\n\
         delay 0.2\n\
         key code 36\n\
         delay 0.3\n\
         key code 36\n\
         end tell"
    )
}

/// SendKeys treats `+^%~(){}` as control sequences; wrap each in braces.
pub fn escape_sendkeys(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '+' | '^' | '%' | '~' | '(' | ')' | '{' | '}' => {
                out.push('{');
                out.push(c);
                out.push('}');
            }
            other => out.push(other),
        }
    }
    out
}

/// PowerShell double-quoted strings escape `"` as `` `" ``.
pub fn escape_powershell(value: &str) -> String {
    value.replace('"', "`\"")
}

#[allow(dead_code)]
fn powershell_sendkeys(keys: &str) -> String {
    format!(
        "Add-Type -AssemblyName System.Windows.Forms; \
         [System.Windows.Forms.SendKeys]::SendWait(\"{}\")",
        escape_powershell(keys)
    )
}

/// Scripted stand-in for tests: succeeds or fails on demand and records
/// every injected path.
#[derive(Default)]
pub struct ScriptedAutomation {
    pub pid: Option<u32>,
    pub fail_injection: bool,
    pub injected: std::sync::Mutex<Vec<(u32, String)>>,
}

#[async_trait]
impl BrowserAutomation for ScriptedAutomation {
    async fn detect_browser_pid(&self) -> Result<u32, ToolError> {
        self.pid
            .ok_or_else(|| ToolError::PidNotFound("scripted: no pid".into()))
    }

    async fn inject_path(&self, pid: u32, path: &str) -> Result<(), ToolError> {
        if self.fail_injection {
            return Err(ToolError::Internal("scripted injection failure".into()));
        }
        self.injected
            .lock()
            .expect("scripted mutex poisoned")
            .push((pid, path.to_string()));
        Ok(())
    }

    async fn dismiss_dialog(&self, _pid: u32) -> Result<(), ToolError> {
        Ok(())
    }
}

// Probe tools - the trace tool variant set and host availability detection.
//
// Tools are invoked exactly as documented by their wire contract:
//   traceroute -n <ip>
//   scamper -c "trace" -i <ip>
//   mtr -n -r -c <count> <ip>
// Adding a tool means adding a variant, a command builder, and a parser.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceTool {
    Scamper,
    Traceroute,
    Mtr,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown probe tool '{0}'")]
    UnknownTool(String),
    #[error("no probe tool from the preference list is present on this host")]
    NoToolAvailable,
}

impl TraceTool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            TraceTool::Scamper => "scamper",
            TraceTool::Traceroute => "traceroute",
            TraceTool::Mtr => "mtr",
        }
    }

    /// Build the subprocess invocation for one probe of `target`.
    pub fn command(&self, target: &IpAddr, mtr_sample_count: u32) -> Command {
        let mut cmd = Command::new(self.binary_name());
        match self {
            TraceTool::Traceroute => {
                cmd.arg("-n").arg(target.to_string());
            }
            TraceTool::Scamper => {
                cmd.arg("-c").arg("trace").arg("-i").arg(target.to_string());
            }
            TraceTool::Mtr => {
                cmd.arg("-n")
                    .arg("-r")
                    .arg("-c")
                    .arg(mtr_sample_count.to_string())
                    .arg(target.to_string());
            }
        }
        cmd.kill_on_drop(true);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());
        cmd.stdin(std::process::Stdio::null());
        cmd
    }

    /// Whether the tool's binary exists on `PATH`.
    pub fn is_available(&self) -> bool {
        find_in_path(self.binary_name(), &std::env::var_os("PATH")).is_some()
    }
}

impl fmt::Display for TraceTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary_name())
    }
}

impl FromStr for TraceTool {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scamper" => Ok(TraceTool::Scamper),
            "traceroute" => Ok(TraceTool::Traceroute),
            "mtr" => Ok(TraceTool::Mtr),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

/// Resolve the first tool from the preference list that is present on the
/// host. Unknown names in the list are skipped, not fatal: the settings
/// store is operator-writable.
pub fn select_tool(preference: &[String]) -> Result<TraceTool, ToolError> {
    select_tool_with(preference, TraceTool::is_available)
}

fn select_tool_with(
    preference: &[String],
    available: impl Fn(&TraceTool) -> bool,
) -> Result<TraceTool, ToolError> {
    for name in preference {
        let Ok(tool) = name.parse::<TraceTool>() else {
            log::warn!("⚠️ Ignoring unknown tool '{}' in tool_preference", name);
            continue;
        };
        if available(&tool) {
            return Ok(tool);
        }
    }
    Err(ToolError::NoToolAvailable)
}

fn find_in_path(binary: &str, path_var: &Option<std::ffi::OsString>) -> Option<PathBuf> {
    let path_var = path_var.as_ref()?;
    for dir in std::env::split_paths(path_var) {
        let candidate = dir.join(binary);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_tool_name_roundtrip() {
        for tool in [TraceTool::Scamper, TraceTool::Traceroute, TraceTool::Mtr] {
            assert_eq!(tool.binary_name().parse::<TraceTool>().unwrap(), tool);
        }
        assert_eq!(" MTR ".parse::<TraceTool>().unwrap(), TraceTool::Mtr);
        assert!("tcptraceroute".parse::<TraceTool>().is_err());
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_command_arguments() {
        let ip: IpAddr = "1.1.1.1".parse().unwrap();

        let cmd = TraceTool::Traceroute.command(&ip, 4);
        assert_eq!(args_of(&cmd), ["-n", "1.1.1.1"]);

        let cmd = TraceTool::Scamper.command(&ip, 4);
        assert_eq!(args_of(&cmd), ["-c", "trace", "-i", "1.1.1.1"]);

        let cmd = TraceTool::Mtr.command(&ip, 10);
        assert_eq!(args_of(&cmd), ["-n", "-r", "-c", "10", "1.1.1.1"]);
    }

    #[test]
    fn test_select_tool_preference_order() {
        let prefs = vec![
            "scamper".to_string(),
            "traceroute".to_string(),
            "mtr".to_string(),
        ];
        // First present tool wins
        let picked = select_tool_with(&prefs, |t| *t != TraceTool::Scamper).unwrap();
        assert_eq!(picked, TraceTool::Traceroute);

        let picked = select_tool_with(&prefs, |_| true).unwrap();
        assert_eq!(picked, TraceTool::Scamper);

        // Unknown names are skipped, not fatal
        let prefs = vec!["paris-traceroute".to_string(), "mtr".to_string()];
        let picked = select_tool_with(&prefs, |_| true).unwrap();
        assert_eq!(picked, TraceTool::Mtr);

        assert!(matches!(
            select_tool_with(&prefs, |_| false),
            Err(ToolError::NoToolAvailable)
        ));
    }

    #[test]
    fn test_find_in_path_with_fake_tool_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("traceroute");
        fs::write(&fake, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let path_var = Some(std::ffi::OsString::from(dir.path()));
        assert_eq!(find_in_path("traceroute", &path_var), Some(fake));
        assert!(find_in_path("scamper", &path_var).is_none());
        assert!(find_in_path("traceroute", &None).is_none());
    }
}

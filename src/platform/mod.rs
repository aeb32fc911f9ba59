use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that launches an agent CLI by program name.
    /// npm-installed agents are `.cmd` shims on Windows and need the shell.
    fn agent_command(program: &str) -> tokio::process::Command;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory for voicepilot.
    /// Unix: `~/.voicepilot`, Windows: `%APPDATA%\voicepilot`.
    fn data_dir() -> PathBuf;
}

/// `VOICEPILOT_DATA_DIR` wins over the platform default so tests and
/// side-by-side installs can point at their own state.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var("VOICEPILOT_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;

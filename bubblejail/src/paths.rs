//! XDG base-directory discovery and executable lookup.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Packaged (read-only) share directory.
pub const SHARE_DIR: &str = "/usr/share";
/// System-wide configuration directory.
pub const SYSCONF_DIR: &str = "/etc";

/// `$XDG_DATA_HOME/bubblejail` (or the platform equivalent).
pub fn data_home() -> Result<PathBuf> {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(dirs::data_dir)
        .ok_or_else(|| Error::DependencyMissing("XDG data directory".into()))?;
    Ok(base.join("bubblejail"))
}

/// `$XDG_CONFIG_HOME/bubblejail`.
pub fn config_home() -> Result<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(dirs::config_dir)
        .ok_or_else(|| Error::DependencyMissing("XDG config directory".into()))?;
    Ok(base.join("bubblejail"))
}

/// `$XDG_RUNTIME_DIR`. Required for sockets; no fallback.
pub fn runtime_dir() -> Result<PathBuf> {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(dirs::runtime_dir)
        .ok_or_else(|| Error::DependencyMissing("XDG_RUNTIME_DIR".into()))
}

/// `$XDG_DATA_HOME/applications`, where generated desktop entries land.
pub fn applications_dir() -> Result<PathBuf> {
    Ok(data_home()?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
        .join("applications"))
}

/// The user's real home directory.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| Error::DependencyMissing("HOME".into()))
}

/// Searches `$PATH` for a binary.
pub fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_sh() {
        // /bin/sh exists on every supported platform.
        let sh = which("sh").expect("sh on PATH");
        assert!(sh.is_absolute());
    }

    #[test]
    fn which_misses_nonsense() {
        assert!(which("definitely-not-a-real-binary-name").is_none());
    }
}

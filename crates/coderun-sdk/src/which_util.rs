use anyhow::Result;
use std::path::{Path, PathBuf};

/// Locates interpreter and CLI executables.
pub struct WhichUtil;

impl WhichUtil {
    /// Resolve `command` to an executable path.
    ///
    /// Commands containing a path separator are checked as given; bare
    /// names are searched on `PATH`. If `require` is set a missing command
    /// is an error, otherwise `Ok(None)`.
    pub fn which(command: &str, require: bool) -> Result<Option<PathBuf>> {
        let found = if command.is_empty() {
            None
        } else if command.contains(std::path::MAIN_SEPARATOR) {
            let path = Path::new(command);
            Self::is_executable(path).then(|| path.to_path_buf())
        } else {
            Self::search_path(command)
        };

        if found.is_none() && require {
            anyhow::bail!(
                "{command}: command not found. Make sure '{command}' is installed and its location included in the 'PATH' environment variable."
            );
        }
        Ok(found)
    }

    fn search_path(command: &str) -> Option<PathBuf> {
        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var)
            .filter(|dir| dir.is_dir())
            .map(|dir| dir.join(command))
            .find(|candidate| Self::is_executable(candidate))
    }

    #[cfg(unix)]
    fn is_executable(path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_executable(path: &Path) -> bool {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn which_finds_sh() {
        let path = WhichUtil::which("sh", true).unwrap().unwrap();
        assert!(path.is_file());
    }

    #[cfg(unix)]
    #[test]
    fn which_accepts_explicit_path() {
        let sh = WhichUtil::which("sh", true).unwrap().unwrap();
        let again = WhichUtil::which(sh.to_str().unwrap(), true).unwrap();
        assert_eq!(again, Some(sh));
    }

    #[test]
    fn which_returns_none_for_missing() {
        assert!(WhichUtil::which("nonexistent_command_xyz_123", false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn which_errors_when_required_and_missing() {
        assert!(WhichUtil::which("nonexistent_command_xyz_123", true).is_err());
        assert!(WhichUtil::which("", true).is_err());
    }
}

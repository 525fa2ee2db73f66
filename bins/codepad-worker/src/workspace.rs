// Per-execution workspace: a fresh temporary directory holding the source
// and the stdin file, bind-mounted into the sandbox at SANDBOX_DIR.
use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::warn;

/// Mount point of the workspace inside the sandbox
pub const SANDBOX_DIR: &str = "/sandbox";
pub const SOURCE_FILE: &str = "main.cpp";
pub const INPUT_FILE: &str = "input.txt";
pub const BINARY_FILE: &str = "main";

/// Exclusively owned by one execution. The directory is deleted when the
/// value is dropped, whichever way the execution ends.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Allocate an empty workspace and write the job's source and stdin into it.
    pub fn prepare(root: Option<&Path>, source: &str, stdin: &str) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("codepad-");
        let dir = match root {
            Some(root) => builder
                .tempdir_in(root)
                .with_context(|| format!("Failed to allocate workspace under {}", root.display()))?,
            None => builder.tempdir().context("Failed to allocate workspace")?,
        };

        // The sandbox runs as an unprivileged user and must be able to write the binary.
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o777))
            .context("Failed to open workspace permissions")?;

        fs::write(dir.path().join(SOURCE_FILE), source).context("Failed to write source file")?;
        fs::write(dir.path().join(INPUT_FILE), stdin).context("Failed to write stdin file")?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Docker bind spec mounting this workspace at `SANDBOX_DIR`
    pub fn bind(&self, read_only: bool) -> String {
        let mode = if read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.path().display(), SANDBOX_DIR, mode)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.path().join(BINARY_FILE)
    }

    /// Remove the directory now, logging instead of failing if that goes wrong.
    pub fn release(self) {
        let path = self.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_writes_inputs() {
        let ws = Workspace::prepare(None, "int main() {}", "5\n").unwrap();
        assert_eq!(fs::read_to_string(ws.path().join(SOURCE_FILE)).unwrap(), "int main() {}");
        assert_eq!(fs::read_to_string(ws.path().join(INPUT_FILE)).unwrap(), "5\n");
        assert!(!ws.binary_path().exists());

        let mode = fs::metadata(ws.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[test]
    fn test_workspaces_are_isolated() {
        let a = Workspace::prepare(None, "a", "").unwrap();
        let b = Workspace::prepare(None, "b", "").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_release_and_drop_remove_directory() {
        let ws = Workspace::prepare(None, "int main() {}", "").unwrap();
        let path = ws.path().to_path_buf();
        ws.release();
        assert!(!path.exists());

        let ws = Workspace::prepare(None, "int main() {}", "").unwrap();
        let path = ws.path().to_path_buf();
        fs::write(ws.binary_path(), b"\x7fELF").unwrap();
        drop(ws);
        assert!(!path.exists());
    }

    #[test]
    fn test_prepare_fails_for_missing_root() {
        let missing = Path::new("/nonexistent/codepad/root");
        assert!(Workspace::prepare(Some(missing), "x", "").is_err());
    }

    #[test]
    fn test_bind_spec() {
        let ws = Workspace::prepare(None, "x", "").unwrap();
        let bind = ws.bind(true);
        assert!(bind.ends_with(":/sandbox:ro"));
        assert!(bind.starts_with(&ws.path().display().to_string()));
    }
}

//! Ephemeral, exclusively owned execution workspaces.
//!
//! Each request gets one uniquely named directory under a base root
//! (defaulting to the system temp dir). The directory is created at request
//! start, optionally seeded with a `data.csv` dataset, used by zero or more
//! executions, and removed when the owning scope exits - on success, error,
//! or cancellation. Removal is best-effort: a leaked directory under the
//! temp root is an operational concern, not a correctness one.

use crate::errors::Result;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Name of the dataset file written into the workspace root.
pub const DATASET_FILE: &str = "data.csv";

/// A uniquely named, exclusively owned ephemeral directory.
pub struct Workspace {
    id: String,
    path: PathBuf,
    dataset_present: bool,
    cleanup_on_drop: bool,
}

impl Workspace {
    /// Create a new workspace under `base`, creating parents as needed.
    ///
    /// The id combines the creation timestamp with a random suffix, so
    /// collisions between concurrent requests are negligible.
    pub fn create(base: &Path) -> Result<Self> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("sandbox-{millis}-{}", &suffix[..12]);
        let path = base.join(&id);
        std::fs::create_dir_all(&path)?;

        // Only the owning process may write here.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }

        info!("created workspace {:?}", path);

        Ok(Self {
            id,
            path,
            dataset_present: false,
            cleanup_on_drop: true,
        })
    }

    /// Create a workspace under the default base root.
    pub fn create_default() -> Result<Self> {
        Self::create(&default_base())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dataset_present(&self) -> bool {
        self.dataset_present
    }

    /// Write the caller-supplied dataset verbatim as `data.csv` in the
    /// workspace root.
    pub fn write_dataset(&mut self, bytes: &[u8]) -> Result<()> {
        std::fs::write(self.path.join(DATASET_FILE), bytes)?;
        self.dataset_present = true;
        info!("wrote {} byte dataset into workspace {}", bytes.len(), self.id);
        Ok(())
    }

    /// Keep the directory on drop (debugging escape hatch).
    pub fn keep(&mut self) {
        self.cleanup_on_drop = false;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("failed to clean up workspace {:?}: {}", self.path, e);
            } else {
                info!("cleaned up workspace {:?}", self.path);
            }
        }
    }
}

/// Base directory under which workspaces are created.
pub fn default_base() -> PathBuf {
    std::env::temp_dir().join("datapilot-workspaces")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(base.path()).unwrap();
            assert!(ws.path().is_dir());
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn workspace_survives_when_kept() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let mut ws = Workspace::create(base.path()).unwrap();
            ws.keep();
            ws.path().to_path_buf()
        };
        assert!(path.exists());
    }

    #[test]
    fn ids_are_unique() {
        let base = tempfile::tempdir().unwrap();
        let a = Workspace::create(base.path()).unwrap();
        let b = Workspace::create(base.path()).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("sandbox-"));
    }

    #[test]
    fn dataset_round_trips_verbatim() {
        let base = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(base.path()).unwrap();
        assert!(!ws.dataset_present());

        ws.write_dataset(b"a,b\n1,2\n").unwrap();
        assert!(ws.dataset_present());

        let read = std::fs::read_to_string(ws.path().join(DATASET_FILE)).unwrap();
        assert_eq!(read, "a,b\n1,2\n");
    }

    #[test]
    fn cleanup_removes_generated_files_too() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(base.path()).unwrap();
            std::fs::write(ws.path().join("chart.png"), b"\x89PNG").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn directory_is_private_to_owner() {
        use std::os::unix::fs::PermissionsExt;
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::create(base.path()).unwrap();
        let mode = std::fs::metadata(ws.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}

//! Harvesting of generated output files from a workspace.
//!
//! Invoked only after an execution completes. The scan returns files in
//! directory order; that order is filesystem-dependent and deliberately not
//! sorted. A partially produced or unreadable file must not fail the whole
//! result, so per-file errors drop that file and nothing else.

use crate::workspace::Workspace;
use tracing::warn;

/// Extensions recognized as returnable artifacts. Case-sensitive.
const IMAGE_EXTENSIONS: [&str; 3] = [".png", ".jpg", ".jpeg"];

/// A produced file returned across the trust boundary. Raw bytes here;
/// base64 only at the transport edge.
#[derive(Debug, Clone)]
pub struct Image {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Scan `ws` for generated images, in directory order.
pub fn collect(ws: &Workspace) -> Vec<Image> {
    let mut images = Vec::new();

    let entries = match std::fs::read_dir(ws.path()) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("failed to list workspace {:?}: {}", ws.path(), e);
            return images;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            continue;
        }
        match std::fs::read(entry.path()) {
            Ok(bytes) => images.push(Image {
                filename: name.to_string(),
                bytes,
            }),
            Err(e) => warn!("skipping unreadable artifact {:?}: {}", entry.path(), e),
        }
    }

    images
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::create(base.path()).unwrap();
        (base, ws)
    }

    #[test]
    fn collects_single_chart_with_bytes() {
        let (_base, ws) = workspace();
        std::fs::write(ws.path().join("chart.png"), b"\x89PNG\r\n").unwrap();

        let images = collect(&ws);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].filename, "chart.png");
        assert!(!images[0].bytes.is_empty());
    }

    #[test]
    fn filters_non_image_files() {
        let (_base, ws) = workspace();
        std::fs::write(ws.path().join("data.csv"), b"a,b\n").unwrap();
        std::fs::write(ws.path().join("script.py"), b"print(1)\n").unwrap();
        std::fs::write(ws.path().join("fig.jpeg"), b"jpeg-bytes").unwrap();
        std::fs::write(ws.path().join("fig.jpg"), b"jpg-bytes").unwrap();

        let mut names: Vec<String> = collect(&ws).into_iter().map(|i| i.filename).collect();
        names.sort();
        assert_eq!(names, ["fig.jpeg", "fig.jpg"]);
    }

    #[test]
    fn extension_match_is_case_sensitive() {
        let (_base, ws) = workspace();
        std::fs::write(ws.path().join("upper.PNG"), b"bytes").unwrap();

        assert!(collect(&ws).is_empty());
    }

    #[test]
    fn empty_workspace_yields_no_artifacts() {
        let (_base, ws) = workspace();
        assert!(collect(&ws).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_omitted_not_fatal() {
        use std::os::unix::fs::PermissionsExt;
        // Permission bits don't bind root; nothing to observe there.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let (_base, ws) = workspace();
        std::fs::write(ws.path().join("good.png"), b"ok").unwrap();
        let bad = ws.path().join("bad.png");
        std::fs::write(&bad, b"secret").unwrap();
        std::fs::set_permissions(&bad, std::fs::Permissions::from_mode(0o000)).unwrap();

        let images = collect(&ws);
        let names: Vec<&str> = images.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, ["good.png"]);

        // Restore so the workspace can be removed on drop.
        std::fs::set_permissions(&bad, std::fs::Permissions::from_mode(0o600)).unwrap();
    }
}

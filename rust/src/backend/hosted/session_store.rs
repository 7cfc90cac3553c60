// Session persistence across restarts (one JSON file).

use std::path::Path;

use crate::backend::Session;

pub(super) fn load(path: &Path) -> Option<Session> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(session) => Some(session),
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "discarding unreadable stored session");
            clear(path);
            None
        }
    }
}

pub(super) fn save(path: &Path, session: &Session) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(session)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(super) fn clear(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(%e, path = %path.display(), "failed to remove stored session");
        }
    }
}

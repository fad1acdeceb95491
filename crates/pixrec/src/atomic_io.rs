use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Writes `text` next to `path` and renames it into place, so readers never
/// observe a half-written file.
pub(crate) fn write_text_atomic(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let staging = staging_path_for(path);
    if let Err(error) = fs::write(&staging, text) {
        let _ = fs::remove_file(&staging);
        return Err(error);
    }
    if let Err(error) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(error);
    }
    Ok(())
}

fn staging_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("pixrec");
    path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn replaces_existing_file_without_leftovers() {
        let temp = TempDir::new().expect("temp");
        let path = temp.path().join("nested").join("pixrec.json");
        write_text_atomic(&path, "{}").expect("first write");
        write_text_atomic(&path, "{\"a\":1}").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "{\"a\":1}");
        let entries = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(entries, 1);
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DecoderError;

/// Persists artwork payloads and hands back a stable path for the UI.
///
/// Bytes in, reference out; format validation, thumbnailing and palette
/// extraction are someone else's job. Write failures are reported, not fatal.
pub struct ArtworkStore {
    dir: PathBuf,
}

impl ArtworkStore {
    pub fn new(dir: &Path) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            log::error!("Failed to create artwork folder {:?}: {}", dir, e);
        }
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Write `bytes` under a filename derived from `key` and return the path.
    pub fn save(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, DecoderError> {
        let path = self.dir.join(format!("artwork_{}.jpg", sanitize(key)));
        fs::write(&path, bytes).map_err(DecoderError::ArtworkWrite)?;
        log::info!("Saved artwork to {:?} ({} bytes)", path, bytes.len());
        Ok(path)
    }
}

/// Collapse anything that is not alphanumeric into underscores so the key is
/// safe as a filename.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> ArtworkStore {
        let dir = std::env::temp_dir().join(format!("airpipe-artwork-{}-{}", tag, std::process::id()));
        ArtworkStore::new(&dir)
    }

    #[test]
    fn saves_bytes_under_sanitized_key() {
        let store = temp_store("basic");
        let path = store.save("Bob Dylan/Desire: One More Cup", b"jpegbytes").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "artwork_Bob_Dylan_Desire__One_More_Cup.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), b"jpegbytes");
    }

    #[test]
    fn overwrites_same_key() {
        let store = temp_store("overwrite");
        let first = store.save("key", b"one").unwrap();
        let second = store.save("key", b"two").unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }
}

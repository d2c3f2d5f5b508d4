use log::warn;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Local storage for downloaded photo payloads.
///
/// The namespace is shared across all markers and partitioned by file names
/// derived from each record's remote identifier, so concurrent downloads of
/// different records need no coordination.
#[derive(Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn exists(&self, file_name: &str) -> bool {
        self.path_for(file_name).exists()
    }

    pub fn read(&self, file_name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path_for(file_name))
    }

    /// Writes through a temporary sibling and a rename, so a crash mid-write
    /// cannot leave a partial file under the final name.
    pub fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> io::Result<()> {
        let tmp_path = self.root.join(format!("{}.part", file_name));
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, self.path_for(file_name))
    }

    /// Removes the backing file. A missing file is not an error; failures are
    /// logged and absorbed.
    pub fn remove(&self, file_name: &str) {
        let path = self.path_for(file_name);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove media file {}: {}", path.display(), e);
            }
        }
    }
}

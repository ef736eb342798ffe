//! I/O managers for different storage backends

use crate::error::{Result, VdcError};
use bytes::Bytes;
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                _ => Err(VdcError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// How a block stream is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Existing object, read and write in place
    ReadWrite,
    /// Create or truncate, read and write
    Create,
}

/// Seekable byte stream over one stored object
pub trait BlockStream: Read + Write + Seek + Send {
    /// Resize the object, zero filling any growth
    fn resize(&mut self, len: u64) -> Result<()>;
}

impl BlockStream for fs::File {
    fn resize(&mut self, len: u64) -> Result<()> {
        self.set_len(len)?;
        Ok(())
    }
}

/// Trait for I/O operations on dataset storage
pub trait IOManager: Send + Sync {
    /// Read a whole object
    fn read(&self, path: &str) -> Result<Bytes>;

    /// Write a whole object, replacing any previous content
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if a path exists
    fn exists(&self, path: &str) -> Result<bool>;

    /// Delete data at a path
    fn delete(&self, path: &str) -> Result<()>;

    /// List items with a given prefix
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of data at a path
    fn size(&self, path: &str) -> Result<usize>;

    /// Open a seekable stream for block-granular access
    fn open_stream(&self, path: &str, mode: OpenMode) -> Result<Box<dyn BlockStream>>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    fn create_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl IOManager for FileSystemIOManager {
    fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        let data = fs::read(&full_path)?;
        Ok(Bytes::from(data))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        Self::create_parent(&full_path)?;
        fs::write(&full_path, data)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path).exists())
    }

    fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        if full_path.is_dir() {
            for entry in fs::read_dir(&full_path)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn size(&self, path: &str) -> Result<usize> {
        let metadata = fs::metadata(self.full_path(path))?;
        Ok(metadata.len() as usize)
    }

    fn open_stream(&self, path: &str, mode: OpenMode) -> Result<Box<dyn BlockStream>> {
        let full_path = self.full_path(path);
        let mut options = fs::OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::ReadWrite => {
                options.read(true).write(true);
            }
            OpenMode::Create => {
                Self::create_parent(&full_path)?;
                options.read(true).write(true).create(true).truncate(true);
            }
        }
        let file = options.open(&full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VdcError::NotFound(full_path.display().to_string())
            } else {
                VdcError::Io(e)
            }
        })?;
        Ok(Box::new(file))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// Parse URL and create appropriate I/O manager
///
/// Only filesystem URLs are supported. Other storage can be plugged in by
/// implementing the `IOManager` trait.
pub fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;
    use tempfile::TempDir;

    #[test]
    fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        // Write
        let data = b"Hello, VDC!";
        io.write("nested/test.dat", data).unwrap();

        // Read
        let read_data = io.read("nested/test.dat").unwrap();
        assert_eq!(&read_data[..], data);

        // Exists
        assert!(io.exists("nested/test.dat").unwrap());
        assert!(!io.exists("nonexistent.dat").unwrap());

        // Size
        assert_eq!(io.size("nested/test.dat").unwrap(), data.len());
        assert_eq!(io.list("nested").unwrap(), vec!["test.dat".to_string()]);

        // Delete
        io.delete("nested/test.dat").unwrap();
        assert!(!io.exists("nested/test.dat").unwrap());
    }

    #[test]
    fn test_block_stream() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        let mut stream = io.open_stream("data/v.wb0", OpenMode::Create).unwrap();
        stream.resize(16).unwrap();
        stream.seek(SeekFrom::Start(8)).unwrap();
        stream.write_all(&[1, 2, 3, 4]).unwrap();
        drop(stream);

        let mut stream = io.open_stream("data/v.wb0", OpenMode::Read).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0]);

        assert!(matches!(
            io.open_stream("missing.wb0", OpenMode::Read),
            Err(VdcError::NotFound(_))
        ));
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            StorageBackend::from_url("file:///data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("/data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert!(StorageBackend::from_url("s3://bucket/volume").is_err());
    }
}

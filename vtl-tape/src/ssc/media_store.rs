//! Backing storage for virtual tape images

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};

/// Random access storage holding one tape image
pub trait MediaStore: Send {
    /// Read exactly `buf.len()` bytes at `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error>;

    /// Discard everything behind `len`
    fn truncate(&mut self, len: u64) -> Result<(), Error>;

    fn size(&self) -> Result<u64, Error>;

    /// Store opened read-only (no write permission on the image)
    fn read_only(&self) -> bool {
        false
    }

    fn sync(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Resolves barcodes to tape images
pub trait MediaRepository: Send {
    fn open(&self, barcode: &str) -> Result<Box<dyn MediaStore>, Error>;

    fn exists(&self, barcode: &str) -> bool;
}

/// Tape image stored in a regular file
pub struct FileStore {
    file: File,
    path: PathBuf,
    read_only: bool,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let (file, read_only) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => (file, false),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                let file = File::open(path)
                    .map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
                (file, true)
            }
            Err(err) => bail!("unable to open {:?} - {}", path, err),
        };
        Ok(Self {
            file,
            path: path.to_owned(),
            read_only,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| format_err!("unable to create {:?} - {}", path, err))?;
        Ok(Self {
            file,
            path: path.to_owned(),
            read_only: false,
        })
    }
}

impl MediaStore for FileStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.file.read_exact_at(buf, offset).map_err(|err| {
            format_err!("read {:?} at offset {} failed - {}", self.path, offset, err)
        })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        if self.read_only {
            bail!("tape image {:?} is read-only", self.path);
        }
        self.file.write_all_at(data, offset).map_err(|err| {
            format_err!("write {:?} at offset {} failed - {}", self.path, offset, err)
        })
    }

    fn truncate(&mut self, len: u64) -> Result<(), Error> {
        self.file
            .set_len(len)
            .map_err(|err| format_err!("truncate {:?} failed - {}", self.path, err))
    }

    fn size(&self) -> Result<u64, Error> {
        Ok(self.file.metadata()?.len())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Directory with one image file per barcode
pub struct DirectoryRepository {
    path: PathBuf,
}

impl DirectoryRepository {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }

    pub fn image_path(&self, barcode: &str) -> Result<PathBuf, Error> {
        if barcode.is_empty() || barcode.contains('/') || barcode.starts_with('.') {
            bail!("invalid barcode '{}'", barcode);
        }
        Ok(self.path.join(barcode))
    }
}

impl MediaRepository for DirectoryRepository {
    fn open(&self, barcode: &str) -> Result<Box<dyn MediaStore>, Error> {
        Ok(Box::new(FileStore::open(self.image_path(barcode)?)?))
    }

    fn exists(&self, barcode: &str) -> bool {
        matches!(self.image_path(barcode), Ok(path) if path.exists())
    }
}

/// In-memory tape image
///
/// Clones share the same buffer, so an image survives unload/load
/// cycles as long as one handle is kept.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Vec<u8>>>,
    read_only: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Copy of the raw image
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl MediaStore for MemoryStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            bail!("read beyond end of image ({} > {})", end, data.len());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        if self.read_only {
            bail!("memory image is read-only");
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.try_reserve(end - data.len())
                .map_err(|err| format_err!("unable to grow memory image - {}", err))?;
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<(), Error> {
        self.data.lock().unwrap().truncate(len as usize);
        Ok(())
    }

    fn size(&self) -> Result<u64, Error> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// Repository of in-memory images, keyed by barcode
#[derive(Clone, Default)]
pub struct MemoryRepository {
    images: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, barcode: &str, store: MemoryStore) {
        self.images
            .lock()
            .unwrap()
            .insert(barcode.to_string(), store);
    }

    pub fn get(&self, barcode: &str) -> Option<MemoryStore> {
        self.images.lock().unwrap().get(barcode).cloned()
    }
}

impl MediaRepository for MemoryRepository {
    fn open(&self, barcode: &str) -> Result<Box<dyn MediaStore>, Error> {
        match self.get(barcode) {
            Some(store) => Ok(Box::new(store)),
            None => bail!("no such media '{}'", barcode),
        }
    }

    fn exists(&self, barcode: &str) -> bool {
        self.images.lock().unwrap().contains_key(barcode)
    }
}

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use log::debug;

use crate::{
    config::DomConfig,
    error::{DomError, ErrorKind},
    io::{SmallReader, SmallWriter},
    storage::page::{PageStatus, DATA_HEADER_SIZE, NO_PAGE},
    types::DomResult,
    utils::HandyRwLock,
};

// "DOM1"
const MAGIC: u32 = 0x444f_4d31;
const VERSION: u16 = 1;

// magic + version + page_size, enough to size the real header read
const PRELUDE_SIZE: usize = 10;

/// Persistent state of the file, kept on page 0.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub page_size: u32,

    /// Highest page number handed out so far; page 0 is the header itself.
    pub page_count: i64,

    /// Live records across the whole file.
    pub total_count: i64,

    /// Fixed key length hint, -1 when unset.
    pub key_len: i16,

    /// First page of the free list, -1 when empty.
    pub free_list_head: i64,

    /// Root page of the B+-tree, -1 before the first insert.
    pub btree_root: i64,

    /// Pages pre-allocated for structural use.
    pub reserved: Vec<i64>,
}

impl FileHeader {
    fn new(config: &DomConfig) -> Self {
        Self {
            page_size: config.page_size,
            page_count: 0,
            total_count: 0,
            key_len: config.key_len.map(|v| v as i16).unwrap_or(-1),
            free_list_head: NO_PAGE,
            btree_root: NO_PAGE,
            reserved: Vec::new(),
        }
    }

    fn encode(&self) -> DomResult<Vec<u8>> {
        let mut writer = SmallWriter::with_capacity(self.page_size as usize);
        writer.write(&MAGIC);
        writer.write(&VERSION);
        writer.write(&self.page_size);
        writer.write(&self.page_count);
        writer.write(&self.total_count);
        writer.write(&self.key_len);
        writer.write(&self.free_list_head);
        writer.write(&self.btree_root);
        writer.write(&(self.reserved.len() as i32));
        for page in &self.reserved {
            writer.write(page);
        }

        let crc = crc32c::crc32c(writer.as_bytes());
        writer.write(&crc);
        writer.into_padded_bytes(self.page_size as usize)
    }

    fn decode(bytes: &[u8]) -> DomResult<Self> {
        let mut reader = SmallReader::new(bytes);

        let magic = reader.read::<u32>()?;
        if magic != MAGIC {
            return Err(DomError::corruption(&format!(
                "bad magic: {:#010x}",
                magic
            )));
        }
        let version = reader.read::<u16>()?;
        if version != VERSION {
            return Err(DomError::corruption(&format!(
                "unsupported format version: {}",
                version
            )));
        }

        let page_size = reader.read::<u32>()?;
        let page_count = reader.read::<i64>()?;
        let total_count = reader.read::<i64>()?;
        let key_len = reader.read::<i16>()?;
        let free_list_head = reader.read::<i64>()?;
        let btree_root = reader.read::<i64>()?;
        let reserved_count = reader.read::<i32>()?;
        let mut reserved = Vec::with_capacity(reserved_count.max(0) as usize);
        for _ in 0..reserved_count {
            reserved.push(reader.read::<i64>()?);
        }

        let consumed = bytes.len() - reader.remaining();
        let crc = reader.read::<u32>()?;
        let actual = crc32c::crc32c(&bytes[..consumed]);
        if crc != actual {
            return Err(DomError::corruption(&format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                crc, actual
            )));
        }

        Ok(Self {
            page_size,
            page_count,
            total_count,
            key_len,
            free_list_head,
            btree_root,
            reserved,
        })
    }
}

/// The paged container: fixed-size pages behind a single file handle, a
/// free list threaded through unused pages, and the header on page 0.
pub struct PagedFile {
    path: PathBuf,
    file: Mutex<File>,
    header: RwLock<FileHeader>,
    read_only: bool,
}

impl PagedFile {
    /// Create a fresh file, truncating anything already at `path`.
    pub fn create<P: AsRef<Path>>(path: P, config: &DomConfig) -> DomResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let instance = Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(file),
            header: RwLock::new(FileHeader::new(config)),
            read_only: false,
        };
        instance.write_header()?;
        debug!("created paged file {:?}", instance.path);
        Ok(instance)
    }

    /// Open an existing file, or create it when it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P, config: &DomConfig) -> DomResult<Self> {
        if !path.as_ref().exists() {
            if config.read_only {
                return Err(DomError::new(
                    ErrorKind::ReadOnly,
                    &format!("cannot create {:?} read-only", path.as_ref()),
                ));
            }
            return Self::create(path, config);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(path.as_ref())?;

        // the prelude tells us how big the real header page is
        let mut prelude = [0u8; PRELUDE_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut prelude)?;
        let mut reader = SmallReader::new(&prelude);
        let _magic = reader.read::<u32>()?;
        let _version = reader.read::<u16>()?;
        let page_size = reader.read::<u32>()?;
        if page_size < (DATA_HEADER_SIZE as u32) * 2 || page_size > 1 << 24 {
            return Err(DomError::corruption(&format!(
                "implausible page size in header: {}",
                page_size
            )));
        }

        let mut bytes = vec![0u8; page_size as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;
        let header = FileHeader::decode(&bytes)?;

        debug!(
            "opened paged file {:?}, pages: {}, records: {}",
            path.as_ref(),
            header.page_count,
            header.total_count
        );

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(file),
            header: RwLock::new(header),
            read_only: config.read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn page_size(&self) -> u32 {
        self.header.rl().page_size
    }

    /// Payload bytes available to records on a data page.
    pub fn work_size(&self) -> usize {
        self.page_size() as usize - DATA_HEADER_SIZE
    }

    pub fn page_count(&self) -> i64 {
        self.header.rl().page_count
    }

    pub fn total_count(&self) -> i64 {
        self.header.rl().total_count
    }

    pub fn increment_total(&self) {
        self.header.wl().total_count += 1;
    }

    pub fn decrement_total(&self) {
        let mut header = self.header.wl();
        if header.total_count > 0 {
            header.total_count -= 1;
        }
    }

    pub fn btree_root(&self) -> i64 {
        self.header.rl().btree_root
    }

    pub fn set_btree_root(&self, root: i64) {
        self.header.wl().btree_root = root;
    }

    pub fn key_len(&self) -> i16 {
        self.header.rl().key_len
    }

    pub fn read_page(&self, page_no: u32) -> DomResult<Vec<u8>> {
        let page_size = self.page_size() as usize;
        let mut buf = vec![0u8; page_size];

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_page(&self, page_no: u32, bytes: &[u8]) -> DomResult<()> {
        if self.read_only {
            return Err(DomError::new(
                ErrorKind::ReadOnly,
                &format!("write to page {} of a read-only file", page_no),
            ));
        }
        let page_size = self.page_size() as usize;
        if bytes.len() != page_size {
            return Err(DomError::invalid_argument(&format!(
                "page image is {} bytes, page size is {}",
                bytes.len(),
                page_size
            )));
        }

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Hand out a page: reuse the free-list head when there is one,
    /// otherwise grow the file.
    pub fn get_free_page(&self) -> DomResult<u32> {
        let mut header = self.header.wl();

        if header.free_list_head >= 0 {
            let page_no = header.free_list_head as u32;
            let bytes = self.read_page_locked(page_no, header.page_size as usize)?;
            let next_free = Self::parse_free_page(page_no, &bytes)?;
            header.free_list_head = next_free;
            debug!("reusing free page {}, next free: {}", page_no, next_free);
            return Ok(page_no);
        }

        header.page_count += 1;
        let page_no = header.page_count as u32;
        debug!("extending file to page {}", page_no);
        Ok(page_no)
    }

    /// Return a page to the free list. The page image on disk is rewritten
    /// as a free page linking to the previous head.
    pub fn unlink_page(&self, page_no: u32) -> DomResult<()> {
        if self.read_only {
            return Err(DomError::new(ErrorKind::ReadOnly, "unlink on a read-only file"));
        }

        let mut header = self.header.wl();
        let page_size = header.page_size as usize;

        let mut writer = SmallWriter::with_capacity(page_size);
        writer.write(&PageStatus::Free.to_u8());
        writer.write(&0u8);
        writer.write(&0i32);
        writer.write(&header.free_list_head);
        let bytes = writer.into_padded_bytes(page_size)?;

        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
            file.write_all(&bytes)?;
        }

        debug!(
            "page {} unlinked, previous free head: {}",
            page_no, header.free_list_head
        );
        header.free_list_head = page_no as i64;
        Ok(())
    }

    // read_page while already holding the header lock
    fn read_page_locked(&self, page_no: u32, page_size: usize) -> DomResult<Vec<u8>> {
        let mut buf = vec![0u8; page_size];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn parse_free_page(page_no: u32, bytes: &[u8]) -> DomResult<i64> {
        let mut reader = SmallReader::new(bytes);
        let status = PageStatus::from_u8(reader.read::<u8>()?)?;
        if status != PageStatus::Free {
            return Err(DomError::corruption(&format!(
                "free-list page {} has status {:?}",
                page_no, status
            )));
        }
        let _dirty = reader.read::<u8>()?;
        let _record_len = reader.read::<i32>()?;
        reader.read::<i64>()
    }

    /// Persist the header. Idempotent; called on every flush.
    pub fn write_header(&self) -> DomResult<()> {
        if self.read_only {
            return Ok(());
        }
        let bytes = {
            let header = self.header.rl();
            header.encode()?
        };

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Header plus an fsync of the underlying file.
    pub fn sync_all(&self) -> DomResult<()> {
        self.write_header()?;
        let file = self.file.lock().unwrap();
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dom_db_paged_file_{}_{}.db", name, std::process::id()));
        path
    }

    #[test]
    fn test_header_round_trip() {
        let config = DomConfig::default();
        let mut header = FileHeader::new(&config);
        header.page_count = 17;
        header.total_count = 1234;
        header.free_list_head = 9;
        header.btree_root = 3;
        header.reserved = vec![1, 2];

        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), config.page_size as usize);
        let decoded = FileHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.page_count, 17);
        assert_eq!(decoded.total_count, 1234);
        assert_eq!(decoded.free_list_head, 9);
        assert_eq!(decoded.btree_root, 3);
        assert_eq!(decoded.reserved, vec![1, 2]);
    }

    #[test]
    fn test_header_checksum_detects_damage() {
        let header = FileHeader::new(&DomConfig::default());
        let mut bytes = header.encode().unwrap();
        bytes[12] ^= 0xff;
        let err = FileHeader::decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_free_list_reuse() {
        let path = temp_path("free_list");
        let config = DomConfig::default();
        let file = PagedFile::create(&path, &config).unwrap();

        let a = file.get_free_page().unwrap();
        let b = file.get_free_page().unwrap();
        assert_eq!((a, b), (1, 2));

        file.unlink_page(a).unwrap();
        // the freed page comes back before the file grows again
        assert_eq!(file.get_free_page().unwrap(), a);
        assert_eq!(file.get_free_page().unwrap(), 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_reopen_keeps_header() {
        let path = temp_path("reopen");
        let config = DomConfig::default();
        {
            let file = PagedFile::create(&path, &config).unwrap();
            file.get_free_page().unwrap();
            file.set_btree_root(1);
            file.increment_total();
            file.write_header().unwrap();
        }
        {
            let file = PagedFile::open(&path, &config).unwrap();
            assert_eq!(file.page_count(), 1);
            assert_eq!(file.btree_root(), 1);
            assert_eq!(file.total_count(), 1);
        }
        std::fs::remove_file(&path).unwrap();
    }
}

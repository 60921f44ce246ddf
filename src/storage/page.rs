use log::warn;

use crate::{
    cache::Cacheable,
    error::DomError,
    io::{SmallReader, SmallWriter},
    storage::paged_file::PagedFile,
    types::DomResult,
};

pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Sentinel for "no page" in chain links and header slots.
pub const NO_PAGE: i64 = -1;

// status byte + dirty byte + record_len (i32)
pub const COMMON_HEADER_SIZE: usize = 6;

// common header + record_count (i16) + data_length (i32)
// + next_data_page (i64) + prev_data_page (i64) + next_tid (i16)
pub const DATA_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 2 + 4 + 8 + 8 + 2;

// tid (u16) + len (u16) in front of every record
pub const RECORD_OVERHEAD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Free,
    Record,
    BTreeInner,
    BTreeLeaf,
}

impl PageStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            PageStatus::Free => 0,
            PageStatus::Record => 1,
            PageStatus::BTreeInner => 2,
            PageStatus::BTreeLeaf => 3,
        }
    }

    pub fn from_u8(value: u8) -> DomResult<Self> {
        match value {
            0 => Ok(PageStatus::Free),
            1 => Ok(PageStatus::Record),
            2 => Ok(PageStatus::BTreeInner),
            3 => Ok(PageStatus::BTreeLeaf),
            _ => Err(DomError::corruption(&format!(
                "invalid page status: {}",
                value
            ))),
        }
    }
}

/// In-memory image of a RECORD page: a densely packed run of
/// `[tid][len][bytes]` records plus the chain links to its neighbours.
///
/// Offsets follow one convention throughout the store: a record *position*
/// is the offset of its length field, i.e. two bytes past the tid. The
/// record starts at `position - 2` and its payload at `position + 2`.
pub struct DataPage {
    page_no: u32,

    record_count: u16,

    // number of payload bytes in use, always the sum of (4 + len) over all
    // records on the page
    data_length: u32,

    next_page: i64,
    prev_page: i64,

    // per-page tid allocator; strictly monotonic, never reused
    next_tid: u16,

    // the work area, page size minus the data header
    data: Vec<u8>,

    dirty: bool,
    ref_count: u32,
}

impl DataPage {
    pub fn new(page_no: u32, work_size: usize) -> Self {
        Self {
            page_no,
            record_count: 0,
            data_length: 0,
            next_page: NO_PAGE,
            prev_page: NO_PAGE,
            next_tid: 1,
            data: vec![0; work_size],
            dirty: true,
            ref_count: 0,
        }
    }

    pub fn parse(page_no: u32, bytes: &[u8], work_size: usize) -> DomResult<Self> {
        let mut reader = SmallReader::new(bytes);

        let status = PageStatus::from_u8(reader.read::<u8>()?)?;
        if status != PageStatus::Record {
            return Err(DomError::corruption(&format!(
                "page {} is not a data page, status: {:?}",
                page_no, status
            )));
        }
        let _dirty = reader.read::<u8>()?;
        let _record_len = reader.read::<i32>()?;

        let record_count = reader.read::<i16>()? as u16;
        let data_length = reader.read::<i32>()?;
        let next_page = reader.read::<i64>()?;
        let prev_page = reader.read::<i64>()?;
        let next_tid = reader.read::<i16>()? as u16;

        if data_length < 0 || data_length as usize > work_size {
            return Err(DomError::corruption(&format!(
                "page {} claims {} payload bytes, work size is {}",
                page_no, data_length, work_size
            )));
        }

        let mut data = reader.read_bytes(data_length as usize)?.to_vec();
        data.resize(work_size, 0);

        Ok(Self {
            page_no,
            record_count,
            data_length: data_length as u32,
            next_page,
            prev_page,
            next_tid,
            data,
            dirty: false,
            ref_count: 0,
        })
    }

    pub fn serialize(&self) -> DomResult<Vec<u8>> {
        let page_size = self.data.len() + DATA_HEADER_SIZE;
        let mut writer = SmallWriter::with_capacity(page_size);

        writer.write(&PageStatus::Record.to_u8());
        writer.write(&0u8); // dirty, always persisted clean
        writer.write(&(self.data_length as i32));

        writer.write(&(self.record_count as i16));
        writer.write(&(self.data_length as i32));
        writer.write(&self.next_page);
        writer.write(&self.prev_page);
        writer.write(&(self.next_tid as i16));
        writer.write_bytes(&self.data[..self.data_length as usize]);

        writer.into_padded_bytes(page_size)
    }

    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn record_count(&self) -> u16 {
        self.record_count
    }

    pub fn data_length(&self) -> usize {
        self.data_length as usize
    }

    pub fn next_page(&self) -> i64 {
        self.next_page
    }

    pub fn prev_page(&self) -> i64 {
        self.prev_page
    }

    pub fn set_next_page(&mut self, page: i64) {
        self.next_page = page;
        self.dirty = true;
    }

    pub fn set_prev_page(&mut self, page: i64) {
        self.prev_page = page;
        self.dirty = true;
    }

    pub fn next_tid(&self) -> u16 {
        self.next_tid
    }

    pub fn set_next_tid(&mut self, tid: u16) {
        self.next_tid = tid;
        self.dirty = true;
    }

    pub fn work_size(&self) -> usize {
        self.data.len()
    }

    pub fn free_space(&self) -> usize {
        self.data.len() - self.data_length as usize
    }

    /// Whether a record of `len` payload bytes can land here. A page whose
    /// tid allocator is exhausted counts as full: tids are never reused.
    pub fn can_host(&self, len: usize) -> bool {
        self.free_space() >= len + RECORD_OVERHEAD && self.next_tid < u16::MAX
    }

    fn allocate_tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.dirty = true;
        tid
    }

    fn put_record(&mut self, start: usize, tid: u16, value: &[u8]) {
        self.data[start..start + 2].copy_from_slice(&tid.to_be_bytes());
        self.data[start + 2..start + 4].copy_from_slice(&(value.len() as u16).to_be_bytes());
        self.data[start + 4..start + 4 + value.len()].copy_from_slice(value);
    }

    /// Append a record at the tail of the work area. The caller has checked
    /// `can_host`.
    pub fn append(&mut self, value: &[u8]) -> u16 {
        let tid = self.allocate_tid();
        let start = self.data_length as usize;
        self.put_record(start, tid, value);
        self.data_length += (RECORD_OVERHEAD + value.len()) as u32;
        self.record_count += 1;
        self.dirty = true;
        tid
    }

    /// Insert a record at `start` (a record-start offset), shifting the tail
    /// `[start..data_length]` right to make room.
    pub fn insert_at(&mut self, start: usize, value: &[u8]) -> u16 {
        let need = RECORD_OVERHEAD + value.len();
        let end = self.data_length as usize;
        self.data.copy_within(start..end, start + need);

        let tid = self.allocate_tid();
        self.put_record(start, tid, value);
        self.data_length += need as u32;
        self.record_count += 1;
        self.dirty = true;
        tid
    }

    /// Remove the record whose length field sits at `position`. Returns the
    /// removed payload length.
    pub fn remove_at(&mut self, position: usize) -> usize {
        let len = self.record_len_at(position);
        let start = position - 2;
        let end = position + 2 + len;
        let tail = self.data_length as usize;
        self.data.copy_within(end..tail, start);

        self.data_length -= (RECORD_OVERHEAD + len) as u32;
        self.record_count -= 1;
        self.dirty = true;
        len
    }

    /// Chop the tail `[at..data_length]` off the work area, handing the bytes
    /// to the caller (who moves them to a split page).
    pub fn split_off(&mut self, at: usize) -> Vec<u8> {
        let end = self.data_length as usize;
        let tail = self.data[at..end].to_vec();
        self.data_length = at as u32;
        self.dirty = true;
        tail
    }

    /// Install raw record bytes at the head of an (empty) split page.
    pub fn adopt_tail(&mut self, bytes: &[u8]) {
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data_length = bytes.len() as u32;
        self.dirty = true;
    }

    /// Recompute `record_count` by scanning; needed after a split moved a
    /// variable number of records.
    pub fn recount(&mut self) {
        let mut count: u16 = 0;
        let mut offset = 0usize;
        let end = self.data_length as usize;
        while offset + RECORD_OVERHEAD <= end {
            let len = self.record_len_at(offset + 2);
            if offset + RECORD_OVERHEAD + len > end {
                warn!(
                    "page {}: record at {} overruns data_length {}",
                    self.page_no, offset, end
                );
                break;
            }
            count += 1;
            offset += RECORD_OVERHEAD + len;
        }
        self.record_count = count;
        self.dirty = true;
    }

    pub fn record_tid_at(&self, start: usize) -> u16 {
        u16::from_be_bytes([self.data[start], self.data[start + 1]])
    }

    /// Payload length of the record whose length field sits at `position`.
    pub fn record_len_at(&self, position: usize) -> usize {
        u16::from_be_bytes([self.data[position], self.data[position + 1]]) as usize
    }

    /// Payload bytes of the record whose length field sits at `position`.
    pub fn record_value_at(&self, position: usize) -> &[u8] {
        let len = self.record_len_at(position);
        &self.data[position + 2..position + 2 + len]
    }

    /// Overwrite the payload in place; only legal for an equal-length value.
    pub fn overwrite_at(&mut self, position: usize, value: &[u8]) {
        self.data[position + 2..position + 2 + value.len()].copy_from_slice(value);
        self.dirty = true;
    }

    /// Scan left-to-right for the record with the given tid. Returns the
    /// offset of its length field, or `None` when the tid lives further down
    /// the chain (or nowhere).
    pub fn find_tid(&self, tid: u16) -> Option<usize> {
        let end = self.data_length as usize;
        let mut offset = 0usize;
        while offset + RECORD_OVERHEAD <= end {
            let current = self.record_tid_at(offset);
            let len = self.record_len_at(offset + 2);
            if current == tid {
                return Some(offset + 2);
            }
            if offset + RECORD_OVERHEAD + len > end {
                warn!(
                    "page {}: record at {} overruns data_length {}",
                    self.page_no, offset, end
                );
                return None;
            }
            offset += RECORD_OVERHEAD + len;
        }
        None
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Cacheable for DataPage {
    fn cache_key(&self) -> u32 {
        self.page_no
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn allow_unload(&self) -> bool {
        self.ref_count < 1
    }

    fn sync(&mut self, file: &PagedFile) -> DomResult<()> {
        let bytes = self.serialize()?;
        file.write_page(self.page_no, &bytes)?;
        self.dirty = false;
        Ok(())
    }

    fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    fn decrement_ref(&mut self) {
        if self.ref_count > 0 {
            self.ref_count -= 1;
        }
    }

    fn set_ref_count(&mut self, count: u32) {
        self.ref_count = count;
    }
}

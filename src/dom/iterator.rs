use log::{error, warn};

use crate::{
    dom::store::DomFile,
    error::DomError,
    lock::LockMode,
    storage::{page::RECORD_OVERHEAD, pointer::create_pointer},
    types::DomResult,
    utils::HandyRwLock,
};

/// One record as seen by a traversal: the bytes plus the virtual address
/// they live at.
#[derive(Debug, Clone)]
pub struct RecordValue {
    pub address: u64,
    pub data: Vec<u8>,
}

/// Lazy forward walk over a page chain in document order. Finite and
/// non-restartable: once the chain runs out the iterator stays exhausted.
///
/// The engine lock is taken for the duration of each step only, so a
/// half-consumed iterator parked between steps holds nothing; dropping it
/// can never leak a lock.
pub struct RecordIterator<'a> {
    dom: &'a DomFile,
    owner: u64,

    // current chain position; negative means exhausted
    page_no: i64,
    offset: usize,

    last_address: Option<u64>,
}

impl<'a> RecordIterator<'a> {
    pub(crate) fn new(dom: &'a DomFile, owner: u64, page_no: i64, offset: usize) -> Self {
        Self {
            dom,
            owner,
            page_no,
            offset,
            last_address: None,
        }
    }

    /// Address of the record most recently returned by `next`.
    pub fn current_address(&self) -> Option<u64> {
        self.last_address
    }

    /// Remove the record last returned by `next`. Runs under the exclusive
    /// lock; when the page drains, the iterator hops to the successor page
    /// the same way the chain unlink does.
    pub fn remove(&mut self) -> DomResult<()> {
        self.dom.check_writable()?;
        let address = self
            .last_address
            .take()
            .ok_or_else(|| DomError::invalid_argument("no current record to remove"))?;

        let _guard = self
            .dom
            .engine_lock()
            .acquire(self.owner, LockMode::Exclusive)?;

        let removed = self.dom.remove_record(address)?;
        if removed.page_drained {
            self.page_no = removed.next_page;
            self.offset = 0;
        } else {
            // the tail slid left over the removed record
            self.offset -= RECORD_OVERHEAD + removed.len;
        }
        Ok(())
    }
}

impl Iterator for RecordIterator<'_> {
    type Item = RecordValue;

    fn next(&mut self) -> Option<RecordValue> {
        let _guard = match self
            .dom
            .engine_lock()
            .acquire(self.owner, LockMode::Shared)
        {
            Ok(guard) => guard,
            Err(e) => {
                warn!("iterator step abandoned: {}", e);
                return None;
            }
        };

        loop {
            if self.page_no < 0 {
                return None;
            }
            let pod = match self.dom.data_page(self.page_no as u32) {
                Ok(pod) => pod,
                Err(e) => {
                    error!("iterator lost page {}: {}", self.page_no, e);
                    return None;
                }
            };

            let page = pod.rl();
            if self.offset >= page.data_length() {
                self.page_no = page.next_page();
                self.offset = 0;
                continue;
            }

            let tid = page.record_tid_at(self.offset);
            let len = page.record_len_at(self.offset + 2);
            let data = page.record_value_at(self.offset + 2).to_vec();
            let address = create_pointer(self.page_no as u32, tid);

            self.offset += RECORD_OVERHEAD + len;
            self.last_address = Some(address);
            return Some(RecordValue { address, data });
        }
    }
}

//! DOM storage engine of a native XML database: serialized nodes in
//! document order on chained data pages, a B+-tree from node keys to
//! virtual addresses, two page caches in front of one paged file, and an
//! owner-aware timeout lock over the lot.

pub mod btree;
pub mod cache;
pub mod config;
pub mod dom;
pub mod error;
pub mod io;
pub mod lock;
pub mod log;
pub mod session;
pub mod storage;
pub mod types;
pub mod utils;

pub use btree::query::IndexQuery;
pub use config::DomConfig;
pub use dom::iterator::{RecordIterator, RecordValue};
pub use dom::node::{DocumentShape, KAryShape, NodeKey, NodeProxy};
pub use dom::store::{DomFile, EngineStats};
pub use error::{DomError, ErrorKind};
pub use lock::{LockMode, TimeoutLock};
pub use session::Session;
pub use storage::pointer::{create_pointer, page_from_pointer, tid_from_pointer};

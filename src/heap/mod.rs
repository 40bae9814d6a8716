//! The paged record heap: file handle pool, page allocator/cache, and the
//! heap façade gluing them together (spec §4.1-4.3).

pub mod handle_pool;
pub mod heap;
pub mod page_manager;

pub use handle_pool::FileHandlePool;
pub use heap::PagedHeap;
pub use page_manager::PageManager;

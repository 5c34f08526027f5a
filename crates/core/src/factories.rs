//! Code fetcher and the in-memory modules it runs against.

pub mod core_fetch;
pub use core_fetch::{CodeFetcher, FetcherDeps, SendJob, StoreEvent};

pub mod fn_table_relocator;
pub use fn_table_relocator::FnTableRelocator;

mod mem_code_store;
pub use mem_code_store::MemCodeStore;

pub mod mem_radio;
pub use mem_radio::{MemRadio, RadioFrame};

mod mem_registry;
pub use mem_registry::MemRegistry;

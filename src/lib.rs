pub mod error;
pub mod mem;
pub mod net;
pub mod platform;
pub mod table;
pub mod tree;

pub use error::{Error, Result};
pub use mem::{AllocSite, Heap, HeapBuf, HeapStats, PrintFlags};
pub use net::{
    ConnHandle, IoBuffer, IoCallback, IoEvent, IoOp, OpenFlags, Reactor, ReactorConfig,
    ReactorStats,
};
pub use table::{DictEntry, Dictionary, NameTable, TableOptions};
pub use tree::{Node, Tree, TreeOptions};

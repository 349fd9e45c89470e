#![forbid(unsafe_code)]

mod freelist;
mod meta;
mod page;
mod page_store;

pub use freelist::{Extent, Freelist};
pub use meta::{Meta, MetaStore, META_FORMAT_VERSION, META_MAGIC, META_SLOT_LEN};
pub use page::{page_span, Page};
pub use page_store::{FilePageStore, PageStore};

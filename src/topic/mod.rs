//! Topics: typed key-value streams binding writers to readers.

mod reader;
mod registry;
mod topic;
mod writer;

pub use reader::Reader;
pub use registry::{BatchCallback, KeyScope, Predicate, SampleCallback, Updater};
pub use topic::Topic;
pub use writer::Writer;

pub mod adapter;
pub mod dedup;
pub mod digest;
pub mod error;
pub mod index;
pub mod path_utils;

pub use crate::adapter::FsEventAdapter;
pub use crate::dedup::DedupEngine;
pub use crate::digest::Algorithm;
pub use crate::error::{CoreError, Result};
pub use crate::index::ChecksumIndex;

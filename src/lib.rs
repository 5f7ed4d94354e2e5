#![forbid(unsafe_code)]

pub mod archive;
pub mod dirindex;
pub mod directory;
pub mod error;
pub mod hashcache;
pub mod http_pool;
pub mod prelude;
pub mod repository;
pub mod util;

#[cfg(test)]
mod test_util;


pub use crate::archive::path_safety::{FilterOutcome, PathFilter};
pub use crate::archive::ArchiveExtractor;
pub use crate::error::ResultCode;
pub use crate::repository::{Failure, Repository};

pub mod cache;
pub mod format;
pub mod preprocess;
pub mod registry;
pub mod uri;

mod vfs;
pub use vfs::*;

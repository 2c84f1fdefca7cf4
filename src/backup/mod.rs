//! Producing a backup artifact from the live database.

pub(crate) mod archive;
pub(crate) mod db_dump;

pub use db_dump::{DumpExecutor, executor_for};

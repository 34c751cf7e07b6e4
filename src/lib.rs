#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]

mod blocks;
mod datum;
pub mod engine;
pub mod error;
pub mod format;
mod freelist;
mod hash;
mod payload;

pub use engine::{open, AllocPolicy, HashIndex, Kv, OpenMode};
pub use error::{Error, Result};

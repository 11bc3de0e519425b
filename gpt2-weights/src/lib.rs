//! # gpt2-weights
//!
//! Transport and local persistence for GPT-2 weight blobs.
//!
//! The weights are a flat little-endian `f32` payload. This crate fetches it over HTTP with
//! progress reporting and keeps a single cached copy on disk so later runs skip the download.
//!
//! ```rust,no_run
//! use gpt2_weights::{BlobStore, FileBlobStore, HttpWeightSource, WeightSource, DEFAULT_WEIGHTS_URL, bytes_to_f32};
//!
//! # fn main() -> gpt2_weights::Result<()> {
//! let mut store = FileBlobStore::new("/tmp/gpt2-cache");
//! if !store.exists()? {
//!     let bytes = HttpWeightSource::new(DEFAULT_WEIGHTS_URL)?.fetch(&mut |p| eprint!("\r{p}%"))?;
//!     store.put(&bytes_to_f32(&bytes)?)?;
//! }
//! let values = store.get()?;
//! # Ok(())
//! # }
//! ```

pub mod download;
pub mod error;
pub mod store;
mod utils;

pub use download::{DEFAULT_WEIGHTS_URL, HttpWeightSource, ProgressTracker, WeightSource};
pub use error::{Result, WeightsError};
pub use store::{BlobStore, FileBlobStore, InMemoryStore};
pub use utils::bytes_to_f32;

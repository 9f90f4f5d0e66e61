pub mod blob;
pub mod config;
pub mod error;

pub use blob::{Blob, BlobSink, BlobSource};
pub use error::{CfatError, CfatResult};

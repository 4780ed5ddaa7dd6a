//! A crate providing chunked file transfers to and from S3-compatible object stores.
//!
//! A large local file is split into fixed-size chunks which are uploaded concurrently by a bounded pool of workers, and downloaded back the
//! same way before being reassembled in order. A manifest describing every chunk travels alongside, so that a download can be checked chunk by
//! chunk and then as a whole against the checksum of the original file.
//!
//! Transient transport failures are retried per chunk with a bounded exponential backoff, while integrity failures never are. A chunk which
//! still fails does not abort its siblings by default: the job ends in a terminal state reporting every failed chunk instead.
//!
//! Every job owns its own temporary work area, so that concurrent jobs never share staged chunks:
//!
//! ```text
//!     - work directory
//!       L job-{job_id}-{random}
//!         L part0
//!         L part1
//!         L part...
//! ```
//!
//! and a transferred file lives in its bucket under its destination prefix:
//!
//! ```text
//!     - bucket
//!       L {dst}.manifest
//!       L {dst}/part0
//!       L {dst}/part1
//!       L {dst}/part...
//! ```
//!
//! Downloads are written next to their destination as `{out}.{job_id}.tmp`, and only moved to `{out}` once verified.

pub mod checksum;
pub mod chunk;
pub mod config;

mod coordinator;
pub use coordinator::*;

mod error;
pub use error::*;

pub mod job;
pub mod pool;
pub mod store;
pub mod task;

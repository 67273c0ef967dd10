//! cuefs - per-track views of cue-sheeted album files
//!
//! This library implements a read-only FUSE filesystem that projects a music
//! library onto a mount point while splitting single-file album recordings
//! (FLAC or WAVE plus a cue sheet, embedded or side-car) into individual
//! per-track FLAC files. Opening one of the synthetic track files yields a
//! complete, self-contained FLAC stream covering exactly that track's sample
//! range, with inherited and per-track metadata.
//!
//! # Architecture
//!
//! ```text
//! FUSE upcall ──► fuse (front-end) ──► view (virtual directory)
//!                      │                    │
//!                      │                    └─► probe (album headers + cue) ──► cue (parser)
//!                      │
//!                      └─► cache (artifact store) ──► materialize (flac pipeline)
//! ```

pub mod app;
pub mod cache;
pub mod cue;
pub mod fuse;
pub mod materialize;
pub mod probe;
pub mod tags;
pub mod view;
pub mod vpath;

/// Crate version, surfaced by the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

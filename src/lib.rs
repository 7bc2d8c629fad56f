//! Bootable installation media assembly.
//!
//! Given a previously built disk image and its content-addressable OS
//! commit, this crate produces an architecture-specific bootable ISO,
//! either an installer or a live image. A live ISO additionally carries
//! a discoverable, zero-padded configuration slot that an external tool
//! can later fill with a first-boot config without rebuilding the ISO.
//!
//! Pipeline (strictly sequential, one run per variant):
//!
//! ```text
//! extract ──► live payload (live only) ──► karg filter
//!     ──► compose (per architecture) ──► config slot embed
//!     ──► finalize (the only stage that persists anything)
//! ```
//!
//! ISO 9660 mastering, squashfs compression, and commit checkout stay in
//! external tools behind narrow call contracts (`process`, `commit`);
//! this crate owns the staging, the byte-level embedding protocol, and
//! the failure taxonomy.

pub mod commit;
pub mod compose;
pub mod config;
pub mod embed;
pub mod error;
pub mod extract;
pub mod finalize;
pub mod kargs;
pub mod ledger;
pub mod live;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod worktree;

pub use compose::Architecture;
pub use error::AssembleError;
pub use pipeline::{run, Mode, RunOptions};

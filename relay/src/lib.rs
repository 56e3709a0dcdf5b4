//! MySQL physical-backup relay.
//!
//! Couples an xtrabackup-style subprocess emitting an xbstream archive to
//! an object-store multipart upload or a TCP peer, and provides the mirror
//! receive and extraction paths. The archive itself is opaque: this crate
//! moves bytes, supervises the subprocess chain, and owns ordering and
//! cleanup across process, socket and file boundaries.

pub mod coordinator;
pub mod job;
pub mod pipeline;
pub mod stages;
pub mod store;

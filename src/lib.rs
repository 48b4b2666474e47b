//! Facade crate re-exporting the peer-pool workspace's members. Most
//! consumers depend on `peerpool-p2p` directly; this crate exists so the
//! workspace can be pulled in as a single dependency during integration
//! testing or embedding.
#![warn(missing_docs)]

#[cfg(feature = "peerpool-common")]
pub use peerpool_common as common;

#[cfg(feature = "peerpool-wire")]
pub use peerpool_wire as wire;

#[cfg(feature = "peerpool-p2p")]
pub use peerpool_p2p as p2p;

//! FUSE filesystem implementation
//!
//! Implements the FUSE filesystem interface, translating kernel requests
//! into calls on the layered namespace.

pub mod overlay;

pub use overlay::OverlayFs;

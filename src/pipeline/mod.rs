pub mod extraction;
pub mod source;
pub mod store;
pub mod checkpoint; // resume point derived from the result store

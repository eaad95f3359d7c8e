//! Remote snapshot storage.
//!
//! Repository snapshots are plain tarballs kept in the cluster blob store,
//! addressed by app ID over HTTP.

pub mod blobstore;

pub use blobstore::BlobStore;

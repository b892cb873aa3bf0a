//! Persisted-object store: a typed view over a key-prefixed KV plus a blob
//! store for transcripts, media, and workspace files.
//!
//! The KV commits synchronously per top-level key; reads return plain cloned
//! values, so nothing live ever crosses an RPC boundary. Mutation goes
//! through `patch` (clone, mutate, write back under the same key) — the
//! copy-on-write shape of the transparent-proxy pattern this replaces.

pub mod blob;
pub mod kv;
pub mod object;

pub use blob::{BlobMeta, BlobStore, FsBlobStore, MemoryBlobStore};
pub use kv::{FileKv, KvBackend, MemoryKv};
pub use object::{PersistedCell, PersistedMap, StoreRef};

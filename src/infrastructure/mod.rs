//! Adapters for the domain ports: in-memory stores and test doubles, the
//! RocksDB store behind `storage-rocksdb`, and the Daraja push gateway.

pub mod daraja;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

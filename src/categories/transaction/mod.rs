//! Transaction block implementations
//!
//! Transaction blocks provide durability and recovery mechanisms.

pub mod wal;

pub use wal::WALBlock;

pub mod archive;
pub mod backup;
pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod crypto;
pub mod dump;
pub mod error;
pub mod filter;
pub mod manifest;
pub mod storage;
pub mod verify;

#[cfg(test)]
mod tests;
#[cfg(test)]
pub(crate) mod testutil;

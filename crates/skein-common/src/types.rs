//! Baseline AT Protocol data types used by repositories

pub mod cid;
#[cfg(feature = "crypto")]
pub mod crypto;
pub mod did;
pub mod string;
pub mod tid;

pub mod catalog;
pub mod client;
pub mod decoder;
pub mod frame;
pub mod types;


#[cfg(test)]
pub mod test_utils;

pub use catalog::{CatalogClient, CatalogPool};
pub use client::{ReplicationClient, ReplicationStream, SystemIdentity};
pub use decoder::{decode_logical_message, DecodeError};
pub use frame::{ReplicationFrame, StandbyStatusUpdate};
pub use types::*;

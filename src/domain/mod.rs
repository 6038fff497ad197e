//! Domain types shared by the cache and the data service client.

pub mod entities;
pub mod error;

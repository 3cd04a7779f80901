pub mod catalog;
pub mod cli;
pub mod config;
pub mod data_types;
pub mod filter;
pub mod identity;
pub mod repository;
pub mod schema;

#[cfg(test)]
pub(crate) mod testutils;

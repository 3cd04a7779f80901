pub mod default;
pub mod interface;
#[cfg(feature = "store-postgres")]
pub mod postgres;
pub mod sqlite;
pub mod statements;

pub mod builders;
pub mod db;

pub use builders::{DeviceBuilder, TokenBuilder, UserBuilder};
pub use db::{memory_store, service, TestDb};

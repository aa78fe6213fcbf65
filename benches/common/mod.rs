pub mod config;
pub mod fixtures;

pub use config::BenchConfig;
pub use fixtures::{BenchOrder, FakeDatabase, KeyGenerator};

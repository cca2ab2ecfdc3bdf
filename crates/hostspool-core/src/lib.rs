pub mod config;
pub mod value;

pub use config::PoolConfig;
pub use value::{Value, ValueError};

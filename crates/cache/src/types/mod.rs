//! Type system for the cache

pub mod command;
pub mod key;
pub mod transaction_id;
pub mod value;

pub use command::{Command, CommandResult, PrepareCommand};
pub use key::{Address, Key};
pub use transaction_id::TransactionId;
pub use value::Value;

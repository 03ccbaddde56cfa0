//! Miscellaneous common structs used throughout the library.

mod contact;
mod id;
pub mod messages;
mod routing_table;
mod storage;

pub use contact::*;
pub use id::*;
pub use messages::*;
pub use routing_table::*;
pub use storage::*;

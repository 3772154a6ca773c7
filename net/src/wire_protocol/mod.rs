pub mod buffer;
pub mod chain;
pub mod connection;
pub mod messages;
pub mod probe;
pub mod raw_message;

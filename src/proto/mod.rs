mod connection;
pub(crate) mod dispatch;
mod error;
mod ping_pong;
mod settings;
mod streams;

pub(crate) use self::connection::{Config, Connection};
pub use self::error::{Error, Initiator};
pub(crate) use self::ping_pong::PingPong;
pub(crate) use self::streams::{Config as StreamsConfig, Key, RecvHeaders, Streams};

//! 客户端与服务端共享的协议、传输与转发层

pub mod address;
pub mod cipher;
pub mod compress;
pub mod config;
pub mod counter;
pub mod error;
pub mod frame;
pub mod mux;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use address::Address;
pub use cipher::Cipher;
pub use config::Config;
pub use counter::ByteCounters;
pub use error::{AuthError, Error, Result};
pub use mux::{Multiplexer, MuxStream};
pub use pool::BufferPool;
pub use relay::PipeOptions;
pub use transport::{BoxedConnection, Listener, Protocol, Transport};

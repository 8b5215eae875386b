//! A multi-reactor TCP RPC framework: one accept loop feeds connections to a
//! pool of fd-owning event loops, and decode/worker/writer pools move framed
//! requests through bounded queues over non-blocking sockets.

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod iomux;
pub mod logging;
pub mod reactor;
pub mod register;
pub mod server;
pub mod service;

pub use client::{Call, Client, ClientError};
pub use codec::{Body, BodyCell, CodecRegistry, Header};
pub use config::Config;
pub use error::{DispatchError, NetError, ServiceError};
pub use reactor::ReactorHandle;
pub use register::balance::{Balance, BalanceClient, SelectMode};
pub use register::{Heartbeat, PostInfo, Register, ServiceMap};
pub use server::{Request, Server};
pub use service::Service;

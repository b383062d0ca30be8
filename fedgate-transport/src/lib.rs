pub mod proto;

mod session;
pub use session::*;

mod factory;
pub use factory::*;

mod client;
pub use client::*;

pub mod http;
pub mod memory;
pub mod stdio;
pub mod tcp;
pub mod websocket;

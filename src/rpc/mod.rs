//! Request/response protocol spoken with remote peers

pub mod codec;
pub mod methods;
pub mod server;

pub use methods::{MetaData, RpcMethod, Status};
pub use server::{LocalNode, RpcHandler};

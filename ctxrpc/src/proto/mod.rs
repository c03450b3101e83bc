pub mod message;
pub mod rpc_impl;
pub mod rpc_types;

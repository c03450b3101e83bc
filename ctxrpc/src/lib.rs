pub mod common;
pub mod proto;
pub mod tunnel;

pub use proto::rpc_impl::client::{CallStream, Client, PendingCall, StandAloneClient};
pub use proto::rpc_impl::server::{Server, StandAloneServer};
pub use proto::rpc_impl::service_registry::ServiceRegistry;
pub use proto::rpc_impl::state::{StateController, StateControllerOptions};
pub use proto::rpc_types::error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) mod call;
pub mod client;
pub mod notifier;
pub mod server;
pub mod service_registry;
pub mod state;

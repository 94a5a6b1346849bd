//! Tether Core - symmetric binary RPC over a single persistent connection.
//!
//! One [`Channel`] carries calls in both directions: the side that connected
//! can call services registered by the side that accepted, and vice versa.
//! Both directions share the same framing, correlation and dispatch.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tether_core::{Channel, ChannelOptions, MethodDescriptor, ServiceInterface, ServiceRegistry};
//!
//! struct Agent;
//!
//! impl ServiceInterface for Agent {
//!     const NAME: &'static str = "agent";
//!
//!     fn methods() -> Vec<MethodDescriptor<Self>> {
//!         vec![MethodDescriptor::new("dumpThread", |_agent: Arc<Agent>| async move {
//!             Ok::<_, String>("main: RUNNABLE".to_string())
//!         })]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let registry = Arc::new(ServiceRegistry::new());
//!     registry.register(Arc::new(Agent))?;
//!
//!     let channel = Channel::connect("127.0.0.1:9400", ChannelOptions::new("collector").registry(registry)).await?;
//!     channel
//!         .proxy()
//!         .call::<()>("metrics", "push", (vec![1.0, 2.0],), Duration::from_secs(3))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod serializer;
pub mod transaction;
pub mod wire;

// Re-export commonly used types
pub use channel::{Channel, ChannelOptions, ChannelState};
pub use config::{ChannelConfig, TransportConfig};
pub use dispatcher::{Dispatch, ServerDispatcher};
pub use error::{Result, TetherError};
pub use proxy::{Arguments, ClientProxy, IntoArguments};
pub use registry::{MethodDescriptor, ParamType, ServiceEndpoint, ServiceInterface, ServiceRegistry};
pub use serializer::{
    JsonSerializer, MessagePackSerializer, Serializer, SerializerRegistry, JSON_ID, MESSAGE_PACK_ID,
};
pub use transaction::{CallOutcome, PendingCall, TransactionTable};
pub use wire::{Frame, RequestFrame, ResponseBody, ResponseFrame};

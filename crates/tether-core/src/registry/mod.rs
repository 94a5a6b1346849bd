//! Service registration and endpoint lookup.

mod endpoint;
mod service_registry;

pub use endpoint::{
    Handler, InvokeError, MethodDescriptor, ParamType, ServiceEndpoint, ServiceInterface,
};
pub use service_registry::ServiceRegistry;

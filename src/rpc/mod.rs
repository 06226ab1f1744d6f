//! Typed RPC plumbing shared by the gateway and every backend.
//!
//! Each remote method is described once by an [`Operation`]: the service it
//! belongs to, its method name and its request/response types. The codec,
//! the client and the server are generic over operations, so no service
//! carries its own encode/decode code.

pub mod client;
pub mod codec;
pub mod server;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use client::RpcClient;
pub use codec::BincodeCodec;
pub use server::{RpcServer, RpcServerBuilder, serve};

/// A backend service as seen on the wire and in the registry.
pub trait ServiceDescriptor: Send + Sync + 'static {
    /// Fully qualified RPC service name, used in request paths.
    const NAME: &'static str;
    /// Logical name the service registers under.
    const REGISTRY_NAME: &'static str;
}

/// One unary method of a [`ServiceDescriptor`].
pub trait Operation: Send + Sync + 'static {
    type Service: ServiceDescriptor;
    const METHOD: &'static str;
    /// Cloned once per retry attempt.
    type Request: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Request path, `/<service>/<method>`.
    fn path() -> String {
        format!("/{}/{}", <Self::Service as ServiceDescriptor>::NAME, Self::METHOD)
    }
}

/// Declare a service descriptor.
macro_rules! service {
    (
        $(#[$meta:meta])*
        $name:ident = $rpc_name:literal, registry = $registry:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl $crate::rpc::ServiceDescriptor for $name {
            const NAME: &'static str = $rpc_name;
            const REGISTRY_NAME: &'static str = $registry;
        }
    };
}

/// Declare an operation on a service.
macro_rules! operation {
    (
        $(#[$meta:meta])*
        $name:ident on $service:ty, $method:literal, $req:ty => $resp:ty
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl $crate::rpc::Operation for $name {
            type Service = $service;
            const METHOD: &'static str = $method;
            type Request = $req;
            type Response = $resp;
        }
    };
}

pub(crate) use operation;
pub(crate) use service;

#[cfg(test)]
mod tests {
    use super::*;

    service!(TestService = "test.Echo", registry = "echo");
    operation!(Ping on TestService, "Ping", String => String);

    #[test]
    fn test_operation_path() {
        assert_eq!(Ping::path(), "/test.Echo/Ping");
        assert_eq!(
            <<Ping as Operation>::Service as ServiceDescriptor>::REGISTRY_NAME,
            "echo"
        );
    }
}

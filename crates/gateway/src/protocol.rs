//! Wire message types.
//!
//! One [`Message`] shape carries both requests and responses. It is protobuf-encoded
//! on the bus and hex-encoded protobuf on the client connection.

use bytes::Bytes;

/// Scheme of service destinations.
pub const MICROSERVICE_SCHEME: &str = "microservice";
/// Scheme of client connection hops.
pub const CLIENT_SCHEME: &str = "client";
/// Scheme of gateway hops.
pub const ROUTER_SCHEME: &str = "router";

/// A single routing-path hop.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Route {
    /// `<scheme>://<path>`.
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, optional, tag = "2")]
    pub ip_address: Option<String>,
}

impl Route {
    /// Create a hop without an address.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ip_address: None,
        }
    }

    /// Create a hop `<scheme>://<path>`.
    pub fn with_scheme(scheme: &str, path: &str) -> Self {
        Self::new(format!("{}://{}", scheme, path))
    }

    /// Attach the peer address.
    pub fn at(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    /// Scheme part of the URI, if it has one.
    pub fn scheme(&self) -> Option<&str> {
        self.uri.split_once("://").map(|(scheme, _)| scheme)
    }
}

/// Forward and reverse routing paths. Both are only ever pushed or popped at the tail.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RoutingStack {
    /// Remaining forward path.
    #[prost(message, repeated, tag = "1")]
    pub route_to: Vec<Route>,
    /// Path already traversed.
    #[prost(message, repeated, tag = "2")]
    pub route_from: Vec<Route>,
}

/// Request or response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    #[prost(enumeration = "Method", tag = "2")]
    pub method: i32,
    #[prost(enumeration = "Resource", tag = "3")]
    pub resource: i32,
    /// Opaque payload.
    #[prost(bytes = "bytes", tag = "4")]
    pub body: Bytes,
    #[prost(message, optional, tag = "5")]
    pub routing: Option<RoutingStack>,
    /// Marks the last message for a correlation id.
    #[prost(bool, tag = "6")]
    pub completed: bool,
}

impl Message {
    /// Head of `route_to`, the next destination of a request.
    pub fn destination(&self) -> Option<&Route> {
        self.routing.as_ref().and_then(|r| r.route_to.first())
    }

    /// Routing stack, created empty if absent.
    pub fn routing_mut(&mut self) -> &mut RoutingStack {
        self.routing.get_or_insert_with(RoutingStack::default)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Method {
    Unspecified = 0,
    Get = 1,
    Create = 2,
    Update = 3,
    Delete = 4,
    Reply = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Resource {
    Unspecified = 0,
    Error = 1,
    Health = 2,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn test_route_scheme() {
        assert_eq!(Route::new("microservice://users").scheme(), Some("microservice"));
        assert_eq!(Route::with_scheme(CLIENT_SCHEME, "abc").uri, "client://abc");
        assert_eq!(Route::new("no-scheme").scheme(), None);
    }

    #[test]
    fn test_unknown_enum_values_survive_decoding() {
        let msg = Message {
            correlation_id: "1".to_string(),
            method: 42,
            resource: 7,
            ..Default::default()
        };

        let decoded = Message::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.method, 42);
        assert_eq!(decoded.resource, 7);
        assert_eq!(decoded.method(), Method::Unspecified);
    }

    #[test]
    fn test_routing_mut_initializes_stack() {
        let mut msg = Message::default();
        assert!(msg.destination().is_none());
        msg.routing_mut().route_to.push(Route::new("microservice://a"));
        assert_eq!(msg.destination().unwrap().uri, "microservice://a");
    }
}

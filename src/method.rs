//! RPC method descriptors.

/// The shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    /// One request message, one response message.
    Unary,
    /// A stream of request messages, one response message.
    ClientStreaming,
    /// One request message, a stream of response messages.
    ServerStreaming,
    /// Streams of messages in both directions.
    BidiStreaming,
}

impl MethodType {
    /// Whether the client sends exactly one message.
    ///
    /// For these method types a DATA frame follows the request HEADERS
    /// almost immediately, so the transport skips the explicit flush after
    /// writing the headers.
    pub fn client_sends_one_message(self) -> bool {
        matches!(self, MethodType::Unary | MethodType::ServerStreaming)
    }
}

/// Identifies a single RPC method on a service.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    full_name: String,
    method_type: MethodType,
}

impl MethodDescriptor {
    /// Create a descriptor from the fully-qualified method name
    /// (e.g. `package.Service/Method`, without a leading slash).
    pub fn new(full_name: impl Into<String>, method_type: MethodType) -> Self {
        Self {
            full_name: full_name.into(),
            method_type,
        }
    }

    /// The fully-qualified method name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The method's type.
    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    /// The `:path` pseudo-header value for this method.
    pub fn path(&self) -> String {
        format!("/{}", self.full_name)
    }
}

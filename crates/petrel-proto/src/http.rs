//! HTTP proxy payload messages.
//!
//! The worker registers routes on the daemon's web server; matching
//! requests are forwarded over the channel and the handler suspends until
//! the worker completes the response.

use rkyv::{Archive, Deserialize, Serialize};

/// Worker registers a proxied route.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HttpRegisterUri {
    /// Route path to register.
    pub uri: String,
    /// HTTP method the route is restricted to.
    pub method: String,
}

/// A single query or form variable.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HttpVariable {
    pub field: String,
    pub content: String,
}

/// Daemon forwards a matching request to the worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Proxy session id; the worker echoes it in HTTPRESPONSE.
    pub req_id: u32,
    pub uri: String,
    pub method: String,
    /// Query/form variables copied from the request.
    pub variable_data: Vec<HttpVariable>,
}

/// A single response header.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub header: String,
    pub content: String,
}

/// Worker completes (or streams part of) a proxied response.
///
/// Within one message the parts apply in order: headers, then status,
/// then body bytes, then completion. Headers must precede the first body
/// byte observable by the client.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Session id from the HTTPREQUEST being answered.
    pub req_id: u32,
    /// Headers to append before any body bytes.
    pub header_content: Vec<HttpHeader>,
    /// Status code, if the worker sets one.
    pub resultcode: Option<u16>,
    /// Body bytes to append to the response stream.
    pub content: Option<Vec<u8>>,
    /// When true, the response stream is completed and the suspended
    /// handler is released.
    pub close_response: bool,
}

/// Worker requests a web session token.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpAuthTokenRequest;

/// Daemon replies with a minted token.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HttpAuthToken {
    pub token: String,
}

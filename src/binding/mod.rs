//! HTTP binding codecs.
//!
//! Three transports carry protocol messages: HTTP-Redirect (deflate +
//! base64 in the query string, detached query signature), HTTP-POST
//! (base64 form field, trust from the embedded XML signature), and SOAP
//! 1.1 for synchronous back-channel exchange.
//!
//! Decoding failures are always the peer's fault ([`ExternalError`]),
//! never an internal fault — the distinction drives different HTTP and
//! audit outcomes upstream.

mod post;
mod redirect;
mod soap;

pub use post::*;
pub use redirect::*;
pub use soap::*;

/// SAML bindings cap RelayState at 80 bytes.
pub(crate) const MAX_RELAY_STATE_BYTES: usize = 80;

/// Upper bound on an inflated or form-decoded message. Protocol
/// messages are a few kilobytes; anything approaching this size is an
/// attack on the decoder.
pub(crate) const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

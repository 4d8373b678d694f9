//! DNS-over-HTTPS and ECH config resolution
//!
//! Two distinct DoH paths live here:
//!
//! - **Bootstrap** ([`resolver::EchResolver`]): a wire-format query for
//!   the HTTPS (type 65) record of the ECH domain, sent as a GET with a
//!   base64url `dns=` parameter to a public resolver. The `ech`
//!   SvcParam (key 5) of the answer is the ECH config list used for
//!   every tunnel dial.
//! - **Tunneled** ([`resolver::doh_post_over`]): the UDP ASSOCIATE relay
//!   forwards client DNS queries as POSTs to Cloudflare DoH through the
//!   same ECH-protected channel the tunnel itself uses, so plaintext
//!   DNS never leaves the machine.

pub mod resolver;
pub mod wire;

pub use resolver::EchResolver;

//! se3-client: host side of the secure channel
//!
//! A [`Se3Session`] owns one [`Transport`](se3_transport::Transport) and
//! layers the login handshake and the sealed L1 envelope on top of it.
//! Everything that runs once logged in is written against the
//! [`SecureChannel`] capability, so the extension traits work for any
//! channel implementation:
//!
//! - `channel`: the `Authenticator` and `SecureChannel` capabilities
//! - `session`: `Se3Session`, the concrete session over a transport
//! - `crypto`: `CryptoSession`, device-side cipher sessions and the chunked
//!   encrypt/decrypt/digest built on them
//! - `keys`: `KeyStore`, key records and PIN management

pub mod channel;
pub mod crypto;
pub mod keys;
pub mod session;

pub use channel::{Authenticator, SecureChannel};
pub use crypto::{CipherSpec, CryptoSession, CHUNK_SIZE};
pub use keys::{KeyInfo, KeyStore};
pub use session::Se3Session;

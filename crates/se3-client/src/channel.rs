use se3_core::{AccessLevel, L1Command, Se3Result};
use se3_crypto::Pin;

/// Login lifecycle of a host session.
pub trait Authenticator {
    /// Run the challenge/response handshake for `access` with `pin`.
    ///
    /// The device's proof of the PIN is checked before the host reveals
    /// its own; a mismatch fails with `Status::Pin` without sending Login.
    fn login(&mut self, access: AccessLevel, pin: &Pin) -> Se3Result<()>;

    /// End the session. A no-op when not logged in.
    fn logout(&mut self) -> Se3Result<()>;

    /// Clear whatever session the device holds, including another host's.
    fn forced_logout(&mut self) -> Se3Result<()>;

    fn is_logged_in(&self) -> bool;

    fn access(&self) -> AccessLevel;
}

/// Authenticated request/response channel carrying L1 commands.
pub trait SecureChannel {
    /// Seal `data` under the session key, send it as `cmd` and return the
    /// opened response body. A non-OK device status becomes an error.
    fn call(&mut self, cmd: L1Command, data: &[u8]) -> Se3Result<Vec<u8>>;
}

//! One host session with one device.
//!
//! Login runs the challenge/response handshake in plaintext for the
//! challenge and under the provisional session key for the Login command
//! itself. From then on every request carries the token and is sealed with
//! ENCRYPT|SIGN. Dropping a logged-in session logs out.

use std::time::Duration;

use tracing::{debug, info, warn};

use se3_core::config::{Se3Config, SessionConfig};
use se3_core::types::cmd_flags;
use se3_core::wire::{ByteReader, ByteWriter, DiscoveryInfo};
use se3_core::{AccessLevel, L0Command, L1Command, Se3Error, Se3Result, Status, TransportError};
use se3_crypto::{
    random_challenge, tags_equal, Envelope, LoginProofs, PayloadCrypto, Pbkdf2Sha256, Pin, Token,
    CHALLENGE_SIZE, TOKEN_SIZE,
};
use se3_transport::{identify, BlockTransport, DeviceDescriptor, FileTransport, Transport, Tunnel};

use crate::channel::{Authenticator, SecureChannel};

struct Login {
    access: AccessLevel,
    token: Token,
    crypto: PayloadCrypto,
}

pub struct Se3Session<T: Transport> {
    transport: T,
    exchange_timeout: Duration,
    login_timeout: Duration,
    force_logout: bool,
    login: Option<Login>,
}

impl<B: BlockTransport> Se3Session<Tunnel<B>> {
    /// Open `blocks`, claim the slots if the device does not answer yet, and
    /// return the session together with the device's discovery block.
    pub fn connect(blocks: B, config: &Se3Config) -> Se3Result<(Self, DiscoveryInfo)> {
        let mut tunnel = Tunnel::new(blocks, &config.transport);
        tunnel.open()?;
        let info = identify(tunnel.blocks_mut(), &config.transport)?.ok_or_else(|| {
            TransportError::NotFound("volume does not answer the discovery read".into())
        })?;
        debug!(serial = %info.serial_text(), "device identified");
        Ok((Self::new(tunnel, config), info))
    }
}

impl Se3Session<Tunnel<FileTransport>> {
    /// Connect to a device found by discovery.
    pub fn open(descriptor: &DeviceDescriptor, config: &Se3Config) -> Se3Result<(Self, DiscoveryInfo)> {
        Self::connect(FileTransport::new(&descriptor.marker, &config.transport), config)
    }
}

impl<T: Transport> Se3Session<T> {
    pub fn new(transport: T, config: &Se3Config) -> Self {
        Self::with_timeouts(transport, &config.session, config.transport.exchange_timeout())
    }

    pub fn with_timeouts(transport: T, session: &SessionConfig, exchange_timeout: Duration) -> Self {
        Self {
            transport,
            exchange_timeout,
            login_timeout: session.login_timeout(),
            force_logout: session.force_logout,
            login: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Have the device send `data` back unchanged.
    pub fn echo(&mut self, data: &[u8]) -> Se3Result<Vec<u8>> {
        let response = self
            .transport
            .exchange(L0Command::Echo, cmd_flags::CRC, data, self.exchange_timeout)?;
        response.status.check()?;
        Ok(response.data)
    }

    /// Program the device serial number. Only a fresh device accepts it.
    pub fn factory_init(&mut self, serial: &[u8; 32]) -> Se3Result<()> {
        let response = self
            .transport
            .exchange(L0Command::FactoryInit, 0, serial, self.exchange_timeout)?;
        response.status.check()?;
        Ok(())
    }

    fn plain_call(&mut self, cmd: L1Command, data: &[u8]) -> Se3Result<Vec<u8>> {
        let request = Envelope::new([0u8; TOKEN_SIZE], cmd as u16, data.to_vec()).seal_plain()?;
        let response = self
            .transport
            .exchange(L0Command::L1, 0, &request, self.login_timeout)?;
        response.status.check()?;
        let envelope = Envelope::open_plain(&response.data)?;
        Status::from(envelope.word).check()?;
        Ok(envelope.data)
    }

    fn sealed_call(
        transport: &mut T,
        crypto: &PayloadCrypto,
        token: &[u8; TOKEN_SIZE],
        cmd: L1Command,
        data: &[u8],
        timeout: Duration,
    ) -> Se3Result<Vec<u8>> {
        let request = crypto.seal(
            &Envelope::new(*token, cmd as u16, data.to_vec()),
            cmd_flags::SECURE,
        )?;
        let response = transport.exchange(L0Command::L1, cmd_flags::SECURE, &request, timeout)?;
        response.status.check()?;
        let envelope = crypto.open(&response.data, cmd_flags::SECURE)?;
        Status::from(envelope.word).check()?;
        Ok(envelope.data)
    }

    fn challenge(&mut self, request: &[u8]) -> Se3Result<Vec<u8>> {
        match self.plain_call(L1Command::Challenge, request) {
            Err(Se3Error::Protocol(Status::Opened)) if self.force_logout => {
                warn!("device reports an open session, forcing logout");
                self.forced_logout()?;
                self.plain_call(L1Command::Challenge, request)
            }
            other => other,
        }
    }
}

impl<T: Transport> Authenticator for Se3Session<T> {
    fn login(&mut self, access: AccessLevel, pin: &Pin) -> Se3Result<()> {
        if self.login.is_some() {
            return Err(Status::Opened.into());
        }
        let cc1 = random_challenge();
        let cc2 = random_challenge();
        let mut w = ByteWriter::with_capacity(2 * CHALLENGE_SIZE + 2);
        w.bytes(&cc1).bytes(&cc2).u16(access as u16);
        let response = self.challenge(&w.finish())?;

        let mut r = ByteReader::new(&response);
        let sc = r.array::<CHALLENGE_SIZE>()?;
        let sresp = r.array::<CHALLENGE_SIZE>()?;
        let proofs = LoginProofs::derive(&Pbkdf2Sha256, pin, &sc, &cc1, &cc2);
        if !tags_equal(&sresp, &proofs.sresp) {
            warn!(%access, "device response does not match the PIN");
            return Err(Status::Pin.into());
        }

        let crypto = PayloadCrypto::new(&proofs.key)?;
        let body = Self::sealed_call(
            &mut self.transport,
            &crypto,
            &[0u8; TOKEN_SIZE],
            L1Command::Login,
            &proofs.cresp,
            self.login_timeout,
        )?;
        let token = ByteReader::new(&body).array::<TOKEN_SIZE>()?;
        self.login = Some(Login {
            access,
            token: Token::from_bytes(token),
            crypto,
        });
        info!(%access, "logged in");
        Ok(())
    }

    fn logout(&mut self) -> Se3Result<()> {
        let Some(login) = self.login.take() else {
            return Ok(());
        };
        Self::sealed_call(
            &mut self.transport,
            &login.crypto,
            login.token.as_bytes(),
            L1Command::Logout,
            &[],
            self.exchange_timeout,
        )?;
        info!(access = %login.access, "logged out");
        Ok(())
    }

    fn forced_logout(&mut self) -> Se3Result<()> {
        match self.login.take() {
            Some(login) => {
                Self::sealed_call(
                    &mut self.transport,
                    &login.crypto,
                    login.token.as_bytes(),
                    L1Command::ForcedLogout,
                    &[],
                    self.exchange_timeout,
                )?;
            }
            None => {
                self.plain_call(L1Command::ForcedLogout, &[])?;
            }
        }
        info!("forced logout");
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.login.is_some()
    }

    fn access(&self) -> AccessLevel {
        self.login
            .as_ref()
            .map_or(AccessLevel::None, |login| login.access)
    }
}

impl<T: Transport> SecureChannel for Se3Session<T> {
    fn call(&mut self, cmd: L1Command, data: &[u8]) -> Se3Result<Vec<u8>> {
        let Some(login) = self.login.as_ref() else {
            debug!(?cmd, "not logged in");
            return Err(Status::Access.into());
        };
        Self::sealed_call(
            &mut self.transport,
            &login.crypto,
            login.token.as_bytes(),
            cmd,
            data,
            self.exchange_timeout,
        )
    }
}

impl<T: Transport> Drop for Se3Session<T> {
    fn drop(&mut self) {
        if let Err(e) = self.logout() {
            warn!("logout on drop failed: {e}");
        }
    }
}

impl<T: Transport> std::fmt::Debug for Se3Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Se3Session")
            .field("access", &self.access())
            .field("exchange_timeout", &self.exchange_timeout)
            .finish_non_exhaustive()
    }
}

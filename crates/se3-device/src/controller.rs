//! Device controller: login state, PIN records, key store and crypto
//! sessions, plus the command dispatcher that drives them.
//!
//! Every completed request frame lands in [`DeviceController::handle_frame`],
//! which runs it to completion and returns the outer status and payload.
//! L1 requests are opened with the current channel key, checked against
//! the command policy (plaintext allowance, token, access level) and the
//! result is sealed with the same flags the request used.

use rand::RngCore;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use se3_core::config::DeviceConfig;
use se3_core::types::{cmd_flags, update_flags, ConfigOp, ConfigRecord, KeyEditOp, NO_KEY};
use se3_core::wire::{discovery_status, ByteReader, ByteWriter, DiscoveryInfo, FrameHeader};
use se3_core::{AccessLevel, Algorithm, KeyRange, L0Command, L1Command, Status};
use se3_crypto::{
    random_challenge, tags_equal, Envelope, LoginProofs, Pbkdf2Sha256, PayloadCrypto, Pin,
    SessionKey, Token, AUTH_SIZE, BLOCK_SIZE, CHALLENGE_SIZE, KEY_SIZE, L1_MAX_DATA, TAG_SIZE,
};

use crate::backend::{algorithm_table, CryptoContext};
use crate::keystore::{FlashKeyStore, StoreError, KEY_MAX};
use crate::sessions::SessionTable;

/// Handler for the multiplexed vendor command.
pub trait VendorHandler: Send {
    fn handle(&mut self, access: AccessLevel, request: &[u8]) -> Result<Vec<u8>, Status>;
}

/// Login state machine.
#[derive(Default)]
pub enum LoginState {
    #[default]
    LoggedOut,
    /// Challenge answered, waiting for the host's `cresp`.
    ChallengeIssued {
        access: AccessLevel,
        cresp: Zeroizing<[u8; CHALLENGE_SIZE]>,
        key: SessionKey,
    },
    LoggedIn {
        access: AccessLevel,
        token: Token,
        key: SessionKey,
    },
}

impl std::fmt::Debug for LoginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginState::LoggedOut => f.write_str("LoggedOut"),
            LoginState::ChallengeIssued { access, .. } => {
                write!(f, "ChallengeIssued({access})")
            }
            LoginState::LoggedIn { access, .. } => write!(f, "LoggedIn({access})"),
        }
    }
}

/// Size of a CryptoUpdate request/response header before data1 / out.
const UPDATE_HEADER: usize = 16;
/// Name field of a CryptoList row.
const ALGO_NAME_SIZE: usize = 16;
/// Bytes of one KeyList row: id u32, len u16.
const KEY_ROW: usize = 6;
/// Bytes of one CryptoList row.
const ALGO_ROW: usize = ALGO_NAME_SIZE + 6;

pub struct DeviceController {
    serial: Option<[u8; 32]>,
    hello: [u8; 32],
    /// Indexed by `ConfigRecord`
    pins: [Pin; 2],
    login: LoginState,
    /// AUTH of the last accepted signed request
    last_auth: Option<[u8; AUTH_SIZE]>,
    keys: FlashKeyStore,
    sessions: SessionTable,
    vendor: Option<Box<dyn VendorHandler>>,
}

fn fixed_field(text: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = text.as_bytes();
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

impl DeviceController {
    /// Power-on state: not factory initialised, logged out, default PINs.
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            serial: None,
            hello: fixed_field(&config.hello),
            pins: [Pin::default(), Pin::default()],
            login: LoginState::LoggedOut,
            last_auth: None,
            keys: FlashKeyStore::new(config.flash_size),
            sessions: SessionTable::new(config.arena_size),
            vendor: None,
        }
    }

    pub fn set_vendor_handler(&mut self, handler: Box<dyn VendorHandler>) {
        self.vendor = Some(handler);
    }

    pub fn login_state(&self) -> &LoginState {
        &self.login
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self.login, LoginState::LoggedIn { .. })
    }

    pub fn keys(&self) -> &FlashKeyStore {
        &self.keys
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Contents of the discovery slot.
    pub fn discovery(&self) -> DiscoveryInfo {
        let mut status = 0;
        if self.serial.is_some() {
            status |= discovery_status::FACTORY_INITIALIZED;
        }
        if self.is_logged_in() {
            status |= discovery_status::LOGGED_IN;
        }
        DiscoveryInfo {
            serial: self.serial.unwrap_or([0u8; 32]),
            hello: self.hello,
            status,
        }
    }

    fn access(&self) -> AccessLevel {
        match &self.login {
            LoginState::LoggedIn { access, .. } => *access,
            _ => AccessLevel::None,
        }
    }

    fn token(&self) -> [u8; 16] {
        match &self.login {
            LoginState::LoggedIn { token, .. } => *token.as_bytes(),
            _ => [0u8; 16],
        }
    }

    /// Key protecting the channel right now: the session key once logged
    /// in, the provisional key while a challenge is outstanding.
    fn channel_key(&self) -> Option<&SessionKey> {
        match &self.login {
            LoginState::LoggedOut => None,
            LoginState::ChallengeIssued { key, .. } | LoginState::LoggedIn { key, .. } => Some(key),
        }
    }

    fn reset_login(&mut self) {
        self.login = LoginState::LoggedOut;
        self.sessions.clear();
    }

    // ── L0 ────────────────────────────────────────────────────────────────

    /// Run one request frame. Returns the outer status and response payload.
    pub fn handle_frame(&mut self, header: &FrameHeader, data: &[u8]) -> (Status, Vec<u8>) {
        let cmd = match L0Command::try_from(header.word0) {
            Ok(cmd) => cmd,
            Err(status) => {
                debug!(cmd = header.word0, "unknown frame command");
                return (status, Vec::new());
            }
        };
        trace!(?cmd, flags = header.word1, len = data.len(), "frame");
        match cmd {
            L0Command::Echo => (Status::Ok, data.to_vec()),
            L0Command::FactoryInit => match self.factory_init(data) {
                Ok(()) => (Status::Ok, Vec::new()),
                Err(status) => (status, Vec::new()),
            },
            L0Command::L1 => self.handle_l1(header.word1, data),
        }
    }

    fn factory_init(&mut self, data: &[u8]) -> Result<(), Status> {
        if self.serial.is_some() {
            return Err(Status::InvalidState);
        }
        let serial: [u8; 32] = data.try_into().map_err(|_| Status::InvalidParams)?;
        self.serial = Some(serial);
        info!(serial = %self.discovery().serial_text(), "factory initialised");
        Ok(())
    }

    // ── L1 envelope ───────────────────────────────────────────────────────

    fn handle_l1(&mut self, flags: u16, data: &[u8]) -> (Status, Vec<u8>) {
        let protection = flags & cmd_flags::SECURE;
        if flags & !(cmd_flags::SECURE | cmd_flags::CRC) != 0
            || (protection != 0 && protection != cmd_flags::SECURE)
        {
            return (Status::InvalidParams, Vec::new());
        }

        // Captured before dispatch so Logout and Login responses are sealed
        // under the key the request came in with.
        let crypto = if protection != 0 {
            let Some(key) = self.channel_key() else {
                debug!("secure request without a channel key");
                return (Status::Access, Vec::new());
            };
            match PayloadCrypto::new(key) {
                Ok(crypto) => Some(crypto),
                Err(err) => {
                    warn!(%err, "payload crypto setup failed");
                    return (Status::Hardware, Vec::new());
                }
            }
        } else {
            None
        };

        let request = match &crypto {
            Some(crypto) => {
                let auth = Envelope::auth_of(data);
                if auth.is_some() && auth == self.last_auth {
                    warn!("replayed request rejected");
                    return (Status::Authentication, Vec::new());
                }
                match crypto.open(data, protection) {
                    Ok(envelope) => {
                        self.last_auth = auth;
                        envelope
                    }
                    Err(err) => {
                        warn!(%err, "request envelope rejected");
                        if matches!(self.login, LoginState::ChallengeIssued { .. }) {
                            self.login = LoginState::LoggedOut;
                        }
                        return (Status::Authentication, Vec::new());
                    }
                }
            }
            None => match Envelope::open_plain(data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    debug!(%err, "malformed plaintext envelope");
                    return (Status::InvalidParams, Vec::new());
                }
            },
        };

        let (status, body) = match self.dispatch(&request, crypto.is_some()) {
            Ok(body) => (Status::Ok, body),
            Err(status) => (status, Vec::new()),
        };
        let response = Envelope::new(self.token(), status.code(), body);
        let sealed = match &crypto {
            Some(crypto) => crypto.seal(&response, protection),
            None => response.seal_plain(),
        };
        match sealed {
            Ok(bytes) => (Status::Ok, bytes),
            Err(err) => {
                warn!(%err, "response envelope could not be sealed");
                (Status::Hardware, Vec::new())
            }
        }
    }

    fn dispatch(&mut self, request: &Envelope, secure: bool) -> Result<Vec<u8>, Status> {
        let cmd = L1Command::try_from(request.word)?;
        if !secure && !cmd.allows_plaintext() {
            debug!(?cmd, "plaintext request refused");
            return Err(Status::Access);
        }
        if !cmd.skips_token_check() {
            let valid = match &self.login {
                LoginState::LoggedIn { token, .. } => token.matches(&request.token),
                _ => false,
            };
            if !valid {
                debug!(?cmd, "session token mismatch");
                return Err(Status::Access);
            }
        }
        if cmd.required_access() > self.access() {
            debug!(?cmd, access = %self.access(), "insufficient access");
            return Err(Status::Access);
        }

        let data = request.data.as_slice();
        let result = match cmd {
            L1Command::Challenge => self.challenge(data),
            L1Command::Login => self.login(data),
            L1Command::Logout => {
                self.reset_login();
                info!("logged out");
                Ok(Vec::new())
            }
            L1Command::ForcedLogout => self.forced_logout(),
            L1Command::Config => self.config(data),
            L1Command::KeyEdit => self.key_edit(data),
            L1Command::KeyFind => self.key_find(data),
            L1Command::KeyList => self.key_list(data),
            L1Command::CryptoInit => self.crypto_init(data),
            L1Command::CryptoUpdate => self.crypto_update(data),
            L1Command::CryptoList => self.crypto_list(data),
            L1Command::Vendor => {
                let access = self.access();
                match self.vendor.as_mut() {
                    Some(handler) => handler.handle(access, data),
                    None => Err(Status::UnknownCommand),
                }
            }
        };
        if let Err(status) = &result {
            debug!(?cmd, %status, "command failed");
        }
        result
    }

    // ── Authentication ────────────────────────────────────────────────────

    fn challenge(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut r = ByteReader::new(data);
        let cc1 = r.array::<CHALLENGE_SIZE>()?;
        let cc2 = r.array::<CHALLENGE_SIZE>()?;
        let access = AccessLevel::from_wire(r.u16()?).ok_or(Status::InvalidParams)?;
        if self.is_logged_in() {
            return Err(Status::Opened);
        }
        let record = ConfigRecord::pin_for(access).ok_or(Status::InvalidParams)?;

        let sc = random_challenge();
        let proofs = LoginProofs::derive(
            &Pbkdf2Sha256,
            &self.pins[record as usize],
            &sc,
            &cc1,
            &cc2,
        );
        let mut out = Vec::with_capacity(2 * CHALLENGE_SIZE);
        out.extend_from_slice(&sc);
        out.extend_from_slice(&proofs.sresp);
        self.login = LoginState::ChallengeIssued {
            access,
            cresp: Zeroizing::new(proofs.cresp),
            key: proofs.key.clone(),
        };
        debug!(%access, "challenge issued");
        Ok(out)
    }

    fn login(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let cresp = ByteReader::new(data).array::<CHALLENGE_SIZE>()?;
        match std::mem::take(&mut self.login) {
            LoginState::ChallengeIssued {
                access,
                cresp: expected,
                key,
            } => {
                if !tags_equal(&cresp, expected.as_ref()) {
                    warn!(%access, "login rejected: wrong PIN");
                    return Err(Status::Pin);
                }
                let token = Token::generate();
                self.login = LoginState::LoggedIn { access, token, key };
                info!(%access, "logged in");
                Ok(token.as_bytes().to_vec())
            }
            other => {
                self.login = other;
                Err(Status::InvalidState)
            }
        }
    }

    /// Clears any login without checking the token. Reachable in plaintext,
    /// or under the current channel key when flags are set.
    fn forced_logout(&mut self) -> Result<Vec<u8>, Status> {
        if !matches!(self.login, LoginState::LoggedOut) {
            warn!(state = ?self.login, "forced logout");
        }
        self.reset_login();
        Ok(Vec::new())
    }

    fn config(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut r = ByteReader::new(data);
        let record = ConfigRecord::from_wire(r.u16()?).ok_or(Status::InvalidParams)?;
        let op = ConfigOp::from_wire(r.u16()?).ok_or(Status::InvalidParams)?;
        match op {
            ConfigOp::Get => Ok(self.pins[record as usize].as_bytes().to_vec()),
            ConfigOp::Set => {
                let value = r.array::<KEY_SIZE>()?;
                self.pins[record as usize] = Pin::from_bytes(value);
                info!(?record, "PIN record updated");
                Ok(Vec::new())
            }
        }
    }

    // ── Keys ──────────────────────────────────────────────────────────────

    fn key_edit(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut r = ByteReader::new(data);
        let op = KeyEditOp::from_wire(r.u16()?).ok_or(Status::InvalidParams)?;
        let id = r.u32()?;
        let len = r.u16()? as usize;
        if KeyRange::of(id) != KeyRange::Manual {
            debug!(id, range = ?KeyRange::of(id), "key id outside the manual range");
            return Err(Status::InvalidParams);
        }
        match op {
            KeyEditOp::Delete => {
                if !self.keys.delete(id) {
                    return Err(Status::Resource);
                }
            }
            KeyEditOp::Insert | KeyEditOp::InsertGenerated => {
                if len == 0 || len > KEY_MAX || self.keys.contains(id) {
                    return Err(Status::InvalidParams);
                }
                let value = if op == KeyEditOp::Insert {
                    Zeroizing::new(r.bytes(len)?.to_vec())
                } else {
                    let mut value = Zeroizing::new(vec![0u8; len]);
                    rand::thread_rng().fill_bytes(&mut value);
                    value
                };
                self.keys.insert(id, &value).map_err(|err| match err {
                    StoreError::Full => Status::Memory,
                    StoreError::BadLength(_) => Status::InvalidParams,
                })?;
            }
        }
        info!(id, ?op, "key edited");
        Ok(Vec::new())
    }

    fn key_find(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let id = ByteReader::new(data).u32()?;
        let found = u16::from(self.keys.contains(id));
        Ok(found.to_le_bytes().to_vec())
    }

    fn key_list(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut r = ByteReader::new(data);
        let skip = r.u16()? as usize;
        let max = (r.u16()? as usize).min((L1_MAX_DATA - 2) / KEY_ROW);
        let rows = self.keys.list(skip, max);
        let mut w = ByteWriter::with_capacity(2 + rows.len() * KEY_ROW);
        w.u16(rows.len() as u16);
        for (id, len) in rows {
            w.u32(id).u16(len);
        }
        Ok(w.finish())
    }

    // ── Crypto sessions ───────────────────────────────────────────────────

    fn crypto_init(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut r = ByteReader::new(data);
        let algorithm = Algorithm::from_wire(r.u16()?).ok_or(Status::InvalidParams)?;
        let mode = r.u16()?;
        let key_id = r.u32()?;

        let key = if algorithm.needs_key() {
            if key_id == NO_KEY {
                return Err(Status::InvalidParams);
            }
            Some(self.keys.find(key_id).ok_or(Status::Resource)?)
        } else {
            None
        };
        let ctx = CryptoContext::init(algorithm, mode, key.as_ref().map(|k| k.data.as_slice()))?;
        let sid = self.sessions.open(&ctx)?;
        Ok(sid.to_le_bytes().to_vec())
    }

    fn crypto_update(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut r = ByteReader::new(data);
        let sid = r.u32()?;
        let flags = r.u16()?;
        let len1 = r.u16()? as usize;
        let len2 = r.u16()? as usize;
        r.align(BLOCK_SIZE)?;
        let data1 = r.bytes(len1)?;
        r.align(BLOCK_SIZE)?;
        let data2 = r.bytes(len2)?;

        let tag = if flags & update_flags::AUTH != 0 {
            TAG_SIZE
        } else {
            0
        };
        if UPDATE_HEADER + len2 + tag > L1_MAX_DATA {
            return Err(Status::InvalidParams);
        }

        let mut ctx = self.sessions.load(sid)?;
        let out = match ctx.update(flags, data1, data2) {
            Ok(out) => out,
            Err(status) => {
                self.sessions.close(sid)?;
                return Err(status);
            }
        };
        if flags & update_flags::FINIT != 0 {
            self.sessions.close(sid)?;
        } else {
            self.sessions.store(sid, &ctx)?;
        }

        let mut w = ByteWriter::with_capacity(UPDATE_HEADER + out.len());
        w.u16(out.len() as u16).align(BLOCK_SIZE).bytes(&out);
        Ok(w.finish())
    }

    fn crypto_list(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut r = ByteReader::new(data);
        let skip = r.u16()? as usize;
        let max = (r.u16()? as usize).min((L1_MAX_DATA - 2) / ALGO_ROW);
        let rows: Vec<_> = algorithm_table().into_iter().skip(skip).take(max).collect();
        let mut w = ByteWriter::with_capacity(2 + rows.len() * ALGO_ROW);
        w.u16(rows.len() as u16);
        for info in rows {
            let mut name = [0u8; ALGO_NAME_SIZE];
            let n = info.name.len().min(ALGO_NAME_SIZE);
            name[..n].copy_from_slice(&info.name.as_bytes()[..n]);
            w.bytes(&name)
                .u16(info.algorithm as u16)
                .u16(info.block_size)
                .u16(info.key_size);
        }
        Ok(w.finish())
    }
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("initialised", &self.serial.is_some())
            .field("login", &self.login)
            .field("keys", &self.keys)
            .field("sessions", &self.sessions)
            .field("vendor", &self.vendor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use se3_core::types::mode_word;
    use se3_core::{CipherMode, Direction};

    const L1: FrameHeader = FrameHeader {
        word0: L0Command::L1 as u16,
        word1: 0,
        len: 0,
        token: 0,
        crc: 0,
    };

    fn controller() -> DeviceController {
        DeviceController::new(&DeviceConfig::default())
    }

    fn plain(ctrl: &mut DeviceController, cmd: L1Command, data: Vec<u8>) -> (Status, Envelope) {
        let request = Envelope::new([0u8; 16], cmd as u16, data).seal_plain().unwrap();
        let (outer, body) = ctrl.handle_frame(&L1, &request);
        assert_eq!(outer, Status::Ok);
        let response = Envelope::open_plain(&body).unwrap();
        (Status::from(response.word), response)
    }

    /// Host half of the handshake; returns the session key and token.
    fn login(ctrl: &mut DeviceController, access: AccessLevel, pin: &Pin) -> (SessionKey, Token) {
        let (cc1, cc2) = (random_challenge(), random_challenge());
        let mut req = cc1.to_vec();
        req.extend_from_slice(&cc2);
        req.extend_from_slice(&(access as u16).to_le_bytes());
        let (status, resp) = plain(ctrl, L1Command::Challenge, req);
        assert_eq!(status, Status::Ok);
        let sc: [u8; 32] = resp.data[..32].try_into().unwrap();
        let proofs = LoginProofs::derive(&Pbkdf2Sha256, pin, &sc, &cc1, &cc2);
        assert_eq!(&resp.data[32..], &proofs.sresp);

        let (status, resp) = secure(ctrl, &proofs.key, [0u8; 16], L1Command::Login, proofs.cresp.to_vec());
        assert_eq!(status, Status::Ok);
        let token = Token::from_bytes(resp.data.as_slice().try_into().unwrap());
        (proofs.key.clone(), token)
    }

    fn secure(
        ctrl: &mut DeviceController,
        key: &SessionKey,
        token: [u8; 16],
        cmd: L1Command,
        data: Vec<u8>,
    ) -> (Status, Envelope) {
        let crypto = PayloadCrypto::new(key).unwrap();
        let request = crypto
            .seal(&Envelope::new(token, cmd as u16, data), cmd_flags::SECURE)
            .unwrap();
        let header = FrameHeader {
            word1: cmd_flags::SECURE,
            ..L1
        };
        let (outer, body) = ctrl.handle_frame(&header, &request);
        assert_eq!(outer, Status::Ok, "outer status for {cmd:?}");
        let response = crypto.open(&body, cmd_flags::SECURE).unwrap();
        (Status::from(response.word), response)
    }

    fn admin(ctrl: &mut DeviceController) -> (SessionKey, [u8; 16]) {
        let (key, token) = login(ctrl, AccessLevel::Admin, &Pin::default());
        (key, *token.as_bytes())
    }

    fn key_edit(op: KeyEditOp, id: u32, value: &[u8]) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.u16(op as u16).u32(id).u16(value.len() as u16).bytes(value);
        w.finish()
    }

    #[test]
    fn test_echo_and_factory_init() {
        let mut ctrl = controller();
        let echo = FrameHeader {
            word0: L0Command::Echo as u16,
            ..L1
        };
        assert_eq!(ctrl.handle_frame(&echo, b"ping"), (Status::Ok, b"ping".to_vec()));

        let init = FrameHeader {
            word0: L0Command::FactoryInit as u16,
            ..L1
        };
        assert_eq!(ctrl.discovery().status, 0);
        assert_eq!(ctrl.handle_frame(&init, &[1u8; 31]).0, Status::InvalidParams);
        assert_eq!(ctrl.handle_frame(&init, &[1u8; 32]).0, Status::Ok);
        assert_eq!(ctrl.handle_frame(&init, &[2u8; 32]).0, Status::InvalidState);
        assert_eq!(ctrl.discovery().serial, [1u8; 32]);
        assert_eq!(
            ctrl.discovery().status,
            discovery_status::FACTORY_INITIALIZED
        );

        let unknown = FrameHeader { word0: 77, ..L1 };
        assert_eq!(ctrl.handle_frame(&unknown, &[]).0, Status::UnknownCommand);
    }

    #[test]
    fn test_login_and_logout() {
        let mut ctrl = controller();
        let (key, token) = login(&mut ctrl, AccessLevel::User, &Pin::default());
        assert!(ctrl.is_logged_in());
        assert_ne!(ctrl.discovery().status & discovery_status::LOGGED_IN, 0);

        let (status, _) = secure(&mut ctrl, &key, *token.as_bytes(), L1Command::Logout, vec![]);
        assert_eq!(status, Status::Ok);
        assert!(!ctrl.is_logged_in());

        // The old key no longer opens anything
        let crypto = PayloadCrypto::new(&key).unwrap();
        let request = crypto
            .seal(
                &Envelope::new(*token.as_bytes(), L1Command::KeyList as u16, vec![0; 4]),
                cmd_flags::SECURE,
            )
            .unwrap();
        let header = FrameHeader {
            word1: cmd_flags::SECURE,
            ..L1
        };
        assert_eq!(ctrl.handle_frame(&header, &request).0, Status::Access);
    }

    #[test]
    fn test_second_challenge_while_logged_in_is_opened() {
        let mut ctrl = controller();
        login(&mut ctrl, AccessLevel::User, &Pin::default());
        let mut req = vec![0u8; 64];
        req.extend_from_slice(&1u16.to_le_bytes());
        let (status, _) = plain(&mut ctrl, L1Command::Challenge, req.clone());
        assert_eq!(status, Status::Opened);

        let (status, _) = plain(&mut ctrl, L1Command::ForcedLogout, vec![]);
        assert_eq!(status, Status::Ok);
        assert!(!ctrl.is_logged_in());
        login(&mut ctrl, AccessLevel::User, &Pin::default());
    }

    #[test]
    fn test_wrong_pin_then_fresh_challenge() {
        let mut ctrl = controller();
        let (cc1, cc2) = (random_challenge(), random_challenge());
        let mut req = cc1.to_vec();
        req.extend_from_slice(&cc2);
        req.extend_from_slice(&1u16.to_le_bytes());
        let (_, resp) = plain(&mut ctrl, L1Command::Challenge, req);
        let sc: [u8; 32] = resp.data[..32].try_into().unwrap();
        let wrong = LoginProofs::derive(&Pbkdf2Sha256, &Pin::new(b"nope").unwrap(), &sc, &cc1, &cc2);
        assert_ne!(&resp.data[32..], &wrong.sresp);

        // A login under the wrong key cannot even be opened
        let crypto = PayloadCrypto::new(&wrong.key).unwrap();
        let request = crypto
            .seal(
                &Envelope::new([0; 16], L1Command::Login as u16, wrong.cresp.to_vec()),
                cmd_flags::SECURE,
            )
            .unwrap();
        let header = FrameHeader {
            word1: cmd_flags::SECURE,
            ..L1
        };
        assert_eq!(ctrl.handle_frame(&header, &request).0, Status::Authentication);
        assert!(matches!(ctrl.login_state(), LoginState::LoggedOut));

        login(&mut ctrl, AccessLevel::User, &Pin::default());
    }

    #[test]
    fn test_wrong_cresp_is_pin_error() {
        let mut ctrl = controller();
        let (cc1, cc2) = (random_challenge(), random_challenge());
        let mut req = cc1.to_vec();
        req.extend_from_slice(&cc2);
        req.extend_from_slice(&1u16.to_le_bytes());
        let (_, resp) = plain(&mut ctrl, L1Command::Challenge, req);
        let sc: [u8; 32] = resp.data[..32].try_into().unwrap();
        let proofs = LoginProofs::derive(&Pbkdf2Sha256, &Pin::default(), &sc, &cc1, &cc2);

        let (status, _) = secure(&mut ctrl, &proofs.key, [0; 16], L1Command::Login, vec![0u8; 32]);
        assert_eq!(status, Status::Pin);
        assert!(matches!(ctrl.login_state(), LoginState::LoggedOut));
    }

    #[test]
    fn test_policy_checks() {
        let mut ctrl = controller();
        let (status, _) = plain(&mut ctrl, L1Command::KeyList, vec![0; 4]);
        assert_eq!(status, Status::Access);
        let (status, _) = plain(&mut ctrl, L1Command::Login, vec![0; 32]);
        assert_eq!(status, Status::Access);

        let (key, token) = login(&mut ctrl, AccessLevel::User, &Pin::default());
        let token = *token.as_bytes();
        // Wrong token
        let (status, _) = secure(&mut ctrl, &key, [9u8; 16], L1Command::KeyList, vec![0; 4]);
        assert_eq!(status, Status::Access);
        // User may not edit keys
        let (status, _) = secure(
            &mut ctrl,
            &key,
            token,
            L1Command::KeyEdit,
            key_edit(KeyEditOp::Insert, 5, &[1; 32]),
        );
        assert_eq!(status, Status::Access);
        let (status, _) = secure(&mut ctrl, &key, token, L1Command::Vendor, vec![1]);
        assert_eq!(status, Status::UnknownCommand);
        // Unknown inner command
        let crypto = PayloadCrypto::new(&key).unwrap();
        let request = crypto
            .seal(&Envelope::new(token, 999, vec![]), cmd_flags::SECURE)
            .unwrap();
        let header = FrameHeader {
            word1: cmd_flags::SECURE,
            ..L1
        };
        let (outer, body) = ctrl.handle_frame(&header, &request);
        assert_eq!(outer, Status::Ok);
        let response = crypto.open(&body, cmd_flags::SECURE).unwrap();
        assert_eq!(Status::from(response.word), Status::UnknownCommand);
        // Sign-only is not a supported protection level
        let header = FrameHeader {
            word1: cmd_flags::SIGN,
            ..L1
        };
        assert_eq!(ctrl.handle_frame(&header, &request).0, Status::InvalidParams);
    }

    #[test]
    fn test_replayed_request_is_rejected() {
        let mut ctrl = controller();
        let (key, token) = login(&mut ctrl, AccessLevel::User, &Pin::default());
        let crypto = PayloadCrypto::new(&key).unwrap();
        let request = crypto
            .seal(
                &Envelope::new(*token.as_bytes(), L1Command::KeyList as u16, vec![0; 4]),
                cmd_flags::SECURE,
            )
            .unwrap();
        let header = FrameHeader {
            word1: cmd_flags::SECURE,
            ..L1
        };
        assert_eq!(ctrl.handle_frame(&header, &request).0, Status::Ok);
        assert_eq!(ctrl.handle_frame(&header, &request).0, Status::Authentication);
        assert!(ctrl.is_logged_in());
    }

    #[test]
    fn test_key_edit_ranges_and_duplicates() {
        let mut ctrl = controller();
        let (key, token) = admin(&mut ctrl);
        let edit = |ctrl: &mut DeviceController, body: Vec<u8>| {
            secure(ctrl, &key, token, L1Command::KeyEdit, body).0
        };

        for id in [KeyRange::MANUAL_FIRST, KeyRange::MANUAL_LAST] {
            assert_eq!(edit(&mut ctrl, key_edit(KeyEditOp::Insert, id, &[1; 32])), Status::Ok);
        }
        let foreign = [
            0,
            KeyRange::DEVICE_RESERVED_FIRST,
            KeyRange::DEVICE_RESERVED_LAST,
            KeyRange::KMS_MANAGED_FIRST,
            KeyRange::KMS_MANAGED_LAST,
            KeyRange::KMS_RESERVED_FIRST,
            KeyRange::KMS_RESERVED_LAST,
            NO_KEY,
        ];
        for id in foreign {
            assert_eq!(
                edit(&mut ctrl, key_edit(KeyEditOp::Insert, id, &[1; 32])),
                Status::InvalidParams,
                "insert {id:#x}"
            );
            let mut generated = ByteWriter::new();
            generated
                .u16(KeyEditOp::InsertGenerated as u16)
                .u32(id)
                .u16(32);
            assert_eq!(
                edit(&mut ctrl, generated.finish()),
                Status::InvalidParams,
                "generate {id:#x}"
            );
            assert_eq!(
                edit(&mut ctrl, key_edit(KeyEditOp::Delete, id, &[])),
                Status::InvalidParams,
                "delete {id:#x}"
            );
            assert!(!ctrl.keys().contains(id), "id {id:#x}");
        }
        assert_eq!(
            edit(&mut ctrl, key_edit(KeyEditOp::Insert, 1, &[2; 32])),
            Status::InvalidParams
        );
        assert_eq!(
            edit(&mut ctrl, key_edit(KeyEditOp::Insert, 2, &[])),
            Status::InvalidParams
        );
        assert_eq!(edit(&mut ctrl, key_edit(KeyEditOp::Delete, 1, &[])), Status::Ok);
        assert_eq!(
            edit(&mut ctrl, key_edit(KeyEditOp::Delete, 1, &[])),
            Status::Resource
        );

        let mut generated = ByteWriter::new();
        generated
            .u16(KeyEditOp::InsertGenerated as u16)
            .u32(42)
            .u16(32);
        assert_eq!(edit(&mut ctrl, generated.finish()), Status::Ok);
        assert_eq!(ctrl.keys().find(42).unwrap().data.len(), 32);
    }

    #[test]
    fn test_key_find_and_list() {
        let mut ctrl = controller();
        let (key, token) = admin(&mut ctrl);
        for id in [3u32, 4, 5] {
            let (status, _) = secure(
                &mut ctrl,
                &key,
                token,
                L1Command::KeyEdit,
                key_edit(KeyEditOp::Insert, id, &[id as u8; 16]),
            );
            assert_eq!(status, Status::Ok);
        }
        let (_, resp) = secure(&mut ctrl, &key, token, L1Command::KeyFind, 4u32.to_le_bytes().to_vec());
        assert_eq!(resp.data, 1u16.to_le_bytes());
        let (_, resp) = secure(&mut ctrl, &key, token, L1Command::KeyFind, 9u32.to_le_bytes().to_vec());
        assert_eq!(resp.data, 0u16.to_le_bytes());

        let mut list = ByteWriter::new();
        list.u16(1).u16(10);
        let (_, resp) = secure(&mut ctrl, &key, token, L1Command::KeyList, list.finish());
        let mut r = ByteReader::new(&resp.data);
        assert_eq!(r.u16().unwrap(), 2);
        assert_eq!((r.u32().unwrap(), r.u16().unwrap()), (4, 16));
        assert_eq!((r.u32().unwrap(), r.u16().unwrap()), (5, 16));
    }

    #[test]
    fn test_config_pin_change() {
        let mut ctrl = controller();
        let (key, token) = admin(&mut ctrl);
        let new_pin = Pin::new(b"1234").unwrap();
        let mut set = ByteWriter::new();
        set.u16(ConfigRecord::UserPin as u16)
            .u16(ConfigOp::Set as u16)
            .bytes(new_pin.as_bytes());
        let (status, _) = secure(&mut ctrl, &key, token, L1Command::Config, set.finish());
        assert_eq!(status, Status::Ok);

        let mut get = ByteWriter::new();
        get.u16(ConfigRecord::UserPin as u16).u16(ConfigOp::Get as u16);
        let (_, resp) = secure(&mut ctrl, &key, token, L1Command::Config, get.finish());
        assert_eq!(resp.data, new_pin.as_bytes());

        secure(&mut ctrl, &key, token, L1Command::Logout, vec![]);
        login(&mut ctrl, AccessLevel::User, &new_pin);
    }

    fn update(sid: u32, flags: u16, data1: &[u8], data2: &[u8]) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.u32(sid)
            .u16(flags)
            .u16(data1.len() as u16)
            .u16(data2.len() as u16)
            .align(BLOCK_SIZE)
            .bytes(data1)
            .align(BLOCK_SIZE)
            .bytes(data2);
        w.finish()
    }

    #[test]
    fn test_crypto_session_lifecycle() {
        let mut ctrl = controller();
        let (key, token) = admin(&mut ctrl);
        secure(
            &mut ctrl,
            &key,
            token,
            L1Command::KeyEdit,
            key_edit(KeyEditOp::Insert, 7, &[0x11; 32]),
        );

        let mut init = ByteWriter::new();
        init.u16(Algorithm::Aes as u16)
            .u16(mode_word(CipherMode::Cbc, Direction::Encrypt))
            .u32(7);
        let (status, resp) = secure(&mut ctrl, &key, token, L1Command::CryptoInit, init.finish());
        assert_eq!(status, Status::Ok);
        let sid = ByteReader::new(&resp.data).u32().unwrap();

        let (status, resp) = secure(
            &mut ctrl,
            &key,
            token,
            L1Command::CryptoUpdate,
            update(sid, update_flags::SET_IV, &[0u8; 16], &[]),
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(resp.data[..2], [0, 0]);

        let (status, resp) = secure(
            &mut ctrl,
            &key,
            token,
            L1Command::CryptoUpdate,
            update(sid, update_flags::FINIT, &[], &[0x42; 48]),
        );
        assert_eq!(status, Status::Ok);
        let mut r = ByteReader::new(&resp.data);
        assert_eq!(r.u16().unwrap(), 48);
        assert_eq!(ctrl.sessions().active(), 0);

        // Finalized ids are dead
        let (status, _) = secure(
            &mut ctrl,
            &key,
            token,
            L1Command::CryptoUpdate,
            update(sid, 0, &[], &[0; 16]),
        );
        assert_eq!(status, Status::Expired);
    }

    #[test]
    fn test_crypto_init_errors() {
        let mut ctrl = controller();
        let (key, token) = admin(&mut ctrl);
        secure(
            &mut ctrl,
            &key,
            token,
            L1Command::KeyEdit,
            key_edit(KeyEditOp::Insert, 8, &[0x11; 16]),
        );
        let init = |algo: u16, mode: u16, id: u32| {
            let mut w = ByteWriter::new();
            w.u16(algo).u16(mode).u32(id);
            w.finish()
        };
        let cbc = mode_word(CipherMode::Cbc, Direction::Encrypt);
        let cases = [
            (init(Algorithm::Aes as u16, cbc, 99), Status::Resource),
            (init(Algorithm::Aes as u16, cbc, 8), Status::InvalidParams),
            (init(Algorithm::Aes as u16, cbc, NO_KEY), Status::InvalidParams),
            (init(17, cbc, 8), Status::InvalidParams),
            (init(Algorithm::HmacSha256 as u16, 0, 8), Status::Ok),
            (init(Algorithm::Sha256 as u16, 0, NO_KEY), Status::Ok),
        ];
        for (body, expected) in cases {
            let (status, _) = secure(&mut ctrl, &key, token, L1Command::CryptoInit, body);
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn test_logout_releases_sessions() {
        let mut ctrl = controller();
        let (key, token) = login(&mut ctrl, AccessLevel::User, &Pin::default());
        let mut init = ByteWriter::new();
        init.u16(Algorithm::Sha256 as u16).u16(0).u32(NO_KEY);
        let body = init.finish();
        secure(&mut ctrl, &key, *token.as_bytes(), L1Command::CryptoInit, body.clone());
        secure(&mut ctrl, &key, *token.as_bytes(), L1Command::CryptoInit, body);
        assert_eq!(ctrl.sessions().active(), 2);
        secure(&mut ctrl, &key, *token.as_bytes(), L1Command::Logout, vec![]);
        assert_eq!(ctrl.sessions().active(), 0);
    }

    #[test]
    fn test_crypto_list() {
        let mut ctrl = controller();
        let (key, token) = login(&mut ctrl, AccessLevel::User, &Pin::default());
        let mut list = ByteWriter::new();
        list.u16(0).u16(100);
        let (_, resp) = secure(&mut ctrl, &key, *token.as_bytes(), L1Command::CryptoList, list.finish());
        let mut r = ByteReader::new(&resp.data);
        assert_eq!(r.u16().unwrap() as usize, algorithm_table().len());
        assert_eq!(&r.bytes(3).unwrap(), b"AES");
    }

    struct Counter(u32);

    impl VendorHandler for Counter {
        fn handle(&mut self, access: AccessLevel, request: &[u8]) -> Result<Vec<u8>, Status> {
            assert_eq!(access, AccessLevel::User);
            self.0 += 1;
            let mut out = request.to_vec();
            out.push(self.0 as u8);
            Ok(out)
        }
    }

    #[test]
    fn test_vendor_handler() {
        let mut ctrl = controller();
        ctrl.set_vendor_handler(Box::new(Counter(0)));
        let (key, token) = login(&mut ctrl, AccessLevel::User, &Pin::default());
        let (status, resp) = secure(&mut ctrl, &key, *token.as_bytes(), L1Command::Vendor, vec![9]);
        assert_eq!(status, Status::Ok);
        assert_eq!(resp.data, vec![9, 1]);
    }
}

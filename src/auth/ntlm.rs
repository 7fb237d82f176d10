//! NTLMv2 authentication.
//!
//! Two rounds: the NEGOTIATE message goes out with an empty body, the server
//! answers 401 with a CHALLENGE, and the AUTHENTICATE message is sent along
//! with the real payload. WinRM carries the raw NTLMSSP tokens under the
//! `Negotiate` scheme.

use md4::{Digest, Md4};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::{ensure_steppable, AuthProvider, HandshakeState, Mechanism, StepOutcome};
use crate::error::Result;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;

const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY;

const AUTHENTICATE_FLAGS: u32 =
    NEGOTIATE_UNICODE | NEGOTIATE_NTLM | NEGOTIATE_ALWAYS_SIGN | NEGOTIATE_EXTENDED_SESSIONSECURITY;

/// Header size of the AUTHENTICATE message including version and MIC fields.
const AUTHENTICATE_HEADER_LEN: u32 = 88;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// NTLM provider for a local or domain account.
pub struct NtlmProvider {
    username: String,
    domain: String,
    password: SecretString,
    workstation: String,
    state: HandshakeState,
}

impl NtlmProvider {
    /// Create a provider. `workstation` defaults to the local hostname.
    pub fn new(
        username: impl Into<String>,
        domain: Option<String>,
        password: SecretString,
        workstation: Option<String>,
    ) -> Self {
        let workstation = workstation.unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_uppercase())
                .unwrap_or_else(|_| "WORKSTATION".to_string())
        });

        Self {
            username: username.into(),
            domain: domain.unwrap_or_default(),
            password,
            workstation,
            state: HandshakeState::NotStarted,
        }
    }

    /// Type 1 message. Domain and workstation are left out; the server does
    /// not need them before the challenge.
    fn negotiate_message(&self) -> Vec<u8> {
        let mut message = SIGNATURE.to_vec();
        message.extend_from_slice(&1u32.to_le_bytes());
        message.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
        push_buffer(&mut message, 0, 32);
        push_buffer(&mut message, 0, 32);
        message
    }

    /// Type 3 message answering `challenge`.
    fn authenticate_message(
        &self,
        challenge: &Challenge,
        client_challenge: [u8; 8],
        timestamp: u64,
    ) -> Vec<u8> {
        let response_key = self.response_key();

        // NTLMv2 blob, echoing the server's target info
        let mut blob = vec![1u8, 1, 0, 0];
        blob.extend_from_slice(&[0u8; 4]);
        blob.extend_from_slice(&timestamp.to_le_bytes());
        blob.extend_from_slice(&client_challenge);
        blob.extend_from_slice(&[0u8; 4]);
        blob.extend_from_slice(&challenge.target_info);
        blob.extend_from_slice(&[0u8; 4]);

        let mut proof_input = challenge.server_challenge.to_vec();
        proof_input.extend_from_slice(&blob);
        let nt_proof = hmac_md5(&response_key[..], &proof_input);

        let mut nt_response = nt_proof.to_vec();
        nt_response.extend_from_slice(&blob);

        // With a server timestamp the LMv2 response must be all zeroes.
        let lm_response = if challenge.timestamp.is_some() {
            vec![0u8; 24]
        } else {
            lmv2_response(&response_key[..], &challenge.server_challenge, &client_challenge)
        };

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        let lm_offset = AUTHENTICATE_HEADER_LEN;
        let nt_offset = lm_offset + lm_response.len() as u32;
        let domain_offset = nt_offset + nt_response.len() as u32;
        let user_offset = domain_offset + domain.len() as u32;
        let workstation_offset = user_offset + user.len() as u32;
        let end = workstation_offset + workstation.len() as u32;

        let mut message = SIGNATURE.to_vec();
        message.extend_from_slice(&3u32.to_le_bytes());
        push_buffer(&mut message, lm_response.len(), lm_offset);
        push_buffer(&mut message, nt_response.len(), nt_offset);
        push_buffer(&mut message, domain.len(), domain_offset);
        push_buffer(&mut message, user.len(), user_offset);
        push_buffer(&mut message, workstation.len(), workstation_offset);
        // no encrypted session key
        push_buffer(&mut message, 0, end);
        message.extend_from_slice(&AUTHENTICATE_FLAGS.to_le_bytes());
        // version and MIC, unused
        message.extend_from_slice(&[0u8; 8]);
        message.extend_from_slice(&[0u8; 16]);

        message.extend_from_slice(&lm_response);
        message.extend_from_slice(&nt_response);
        message.extend_from_slice(&domain);
        message.extend_from_slice(&user);
        message.extend_from_slice(&workstation);
        message
    }

    /// NTOWFv2: HMAC-MD5 keyed with the NT hash over `UPPER(user) || domain`.
    fn response_key(&self) -> Zeroizing<[u8; 16]> {
        let nt_hash = nt_hash(self.password.expose_secret());
        let identity = utf16le(&format!("{}{}", self.username.to_uppercase(), self.domain));
        Zeroizing::new(hmac_md5(&nt_hash[..], &identity))
    }
}

impl std::fmt::Debug for NtlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmProvider")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AuthProvider for NtlmProvider {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Ntlm
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn max_rounds(&self) -> usize {
        2
    }

    fn scheme(&self) -> &'static str {
        "Negotiate"
    }

    fn accepts_scheme(&self, scheme: &str) -> bool {
        scheme.eq_ignore_ascii_case("Negotiate") || scheme.eq_ignore_ascii_case("NTLM")
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<StepOutcome> {
        ensure_steppable(self.state)?;

        if self.state == HandshakeState::NotStarted {
            self.state = HandshakeState::Negotiating;
            trace!(username = %self.username, "Sending NTLM negotiate message");
            return Ok(StepOutcome::Continue(self.negotiate_message()));
        }

        let Some(bytes) = challenge else {
            self.state = HandshakeState::Failed;
            return Ok(StepOutcome::Failed("server sent no NTLM challenge".to_string()));
        };

        match Challenge::parse(bytes) {
            Ok(parsed) => {
                debug!(
                    flags = %format!("{:#010x}", parsed.flags),
                    target_info_len = parsed.target_info.len(),
                    "Received NTLM challenge"
                );
                let timestamp = parsed.timestamp.unwrap_or_else(windows_timestamp);
                let message = self.authenticate_message(&parsed, rand::random(), timestamp);
                self.state = HandshakeState::Established;
                Ok(StepOutcome::Done(Some(message)))
            }
            Err(reason) => {
                self.state = HandshakeState::Failed;
                Ok(StepOutcome::Failed(reason))
            }
        }
    }
}

// ============================================================================
// CHALLENGE parsing
// ============================================================================

/// Fields of a Type 2 message needed to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Challenge {
    flags: u32,
    server_challenge: [u8; 8],
    target_info: Vec<u8>,
    timestamp: Option<u64>,
}

impl Challenge {
    fn parse(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < 32 {
            return Err(format!("NTLM challenge too short ({} bytes)", bytes.len()));
        }
        if &bytes[..8] != SIGNATURE {
            return Err("NTLM challenge has an invalid signature".to_string());
        }
        let message_type = read_u32(bytes, 8);
        if message_type != 2 {
            return Err(format!("expected NTLM message type 2, got {message_type}"));
        }

        let flags = read_u32(bytes, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&bytes[24..32]);

        // Older servers send the 32-byte form without target info.
        let target_info = if bytes.len() >= 48 {
            let len = read_u16(bytes, 40) as usize;
            let offset = read_u32(bytes, 44) as usize;
            let end = offset
                .checked_add(len)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| "NTLM target info buffer is out of bounds".to_string())?;
            bytes[offset..end].to_vec()
        } else {
            Vec::new()
        };

        let timestamp = find_timestamp(&target_info);

        Ok(Self {
            flags,
            server_challenge,
            target_info,
            timestamp,
        })
    }
}

/// Walk the AV_PAIR list looking for MsvAvTimestamp.
fn find_timestamp(target_info: &[u8]) -> Option<u64> {
    let mut pos = 0;
    while pos + 4 <= target_info.len() {
        let id = read_u16(target_info, pos);
        let len = read_u16(target_info, pos + 2) as usize;
        if id == AV_EOL {
            break;
        }
        let value = target_info.get(pos + 4..pos + 4 + len)?;
        if id == AV_TIMESTAMP && len == 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(value);
            return Some(u64::from_le_bytes(raw));
        }
        pos += 4 + len;
    }
    None
}

// ============================================================================
// Primitives
// ============================================================================

fn push_buffer(message: &mut Vec<u8>, len: usize, offset: u32) {
    let len = len as u16;
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&offset.to_le_bytes());
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// MD4 of the UTF-16LE password.
fn nt_hash(password: &str) -> Zeroizing<[u8; 16]> {
    let mut hasher = Md4::new();
    hasher.update(utf16le(password));
    let mut hash = Zeroizing::new([0u8; 16]);
    hash.copy_from_slice(&hasher.finalize());
    hash
}

fn lmv2_response(key: &[u8], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Vec<u8> {
    let mut data = server_challenge.to_vec();
    data.extend_from_slice(client_challenge);
    let mut response = hmac_md5(key, &data).to_vec();
    response.extend_from_slice(client_challenge);
    response
}

/// HMAC-MD5 (RFC 2104).
fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut key_block = [0u8; 64];
    if key.len() > 64 {
        key_block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(64 + data.len());
    inner.extend(key_block.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(data);
    let inner_hash = md5::compute(&inner);

    let mut outer = Vec::with_capacity(64 + 16);
    outer.extend(key_block.iter().map(|b| b ^ 0x5c));
    outer.extend_from_slice(&inner_hash.0);
    md5::compute(&outer).0
}

/// Current time as a Windows FILETIME (100ns ticks since 1601-01-01).
fn windows_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    const EPOCH_DIFF_SECS: u64 = 11_644_473_600;
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_unix.as_secs() + EPOCH_DIFF_SECS) * 10_000_000 + u64::from(since_unix.subsec_nanos() / 100)
}

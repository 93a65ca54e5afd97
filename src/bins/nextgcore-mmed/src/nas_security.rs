//! NAS Security
//!
//! Security header types of the EPS NAS envelope, the per-UE NAS security
//! context and the verify/decipher hook applied to uplink NAS messages.
//!
//! Integrity and ciphering algorithms live outside the MME; they plug in
//! through `NasSecurityEngine`. `NullNasSecurity` handles the EIA0/EEA0
//! case and keeps the uplink NAS COUNT in step.

use std::fmt;

use ogs_core::OgsPkbuf;
use thiserror::Error;

use crate::error::ErrorClass;

// ============================================================================
// Constants
// ============================================================================

/// NAS headroom reserved in front of every uplink NAS buffer
pub const OGS_NAS_HEADROOM: usize = 16;

/// Security protected NAS header: type/PD (1) + MAC (4) + SQN (1)
pub const NAS_SECURITY_HEADER_LEN: usize = 6;

/// NAS security MAC size in bytes
pub const NAS_SECURITY_MAC_SIZE: usize = 4;

/// EPS mobility management protocol discriminator
pub const OGS_NAS_PROTOCOL_DISCRIMINATOR_EMM: u8 = 0x7;
/// EPS session management protocol discriminator
pub const OGS_NAS_PROTOCOL_DISCRIMINATOR_ESM: u8 = 0x2;

/// EIA0 / EEA0
pub const OGS_NAS_SECURITY_ALGORITHMS_NULL: u8 = 0;

// ============================================================================
// Errors
// ============================================================================

/// NAS envelope errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NasError {
    #[error("empty NAS-PDU")]
    EmptyPdu,

    #[error("NAS message too short: need {needed} octets, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown security header type 0x{0:x}")]
    UnknownSecurityHeaderType(u8),

    #[error("unsupported NAS algorithm EIA{int}/EEA{enc}")]
    UnsupportedAlgorithm { int: u8, enc: u8 },

    #[error("NAS security decode failed: {0}")]
    SecurityDecode(String),

    #[error("no eNB UE context")]
    EnbUeNotFound,

    #[error("no MME UE context")]
    MmeUeNotFound,

    #[error("no ESM context (UE:{imsi_bcd}, PTI:{pti})")]
    SessionNotFound { imsi_bcd: String, pti: u8 },

    #[error("unknown protocol discriminator {0}")]
    UnknownProtocolDiscriminator(u8),

    #[error("event channel closed")]
    EventChannelClosed,
}

pub type NasResult<T> = Result<T, NasError>;

impl NasError {
    pub fn class(&self) -> ErrorClass {
        match self {
            NasError::EmptyPdu | NasError::Truncated { .. } => ErrorClass::Malformed,
            NasError::UnknownSecurityHeaderType(_) => ErrorClass::Unimplemented,
            NasError::EnbUeNotFound
            | NasError::MmeUeNotFound
            | NasError::SessionNotFound { .. } => ErrorClass::NotFound,
            NasError::UnsupportedAlgorithm { .. }
            | NasError::SecurityDecode(_)
            | NasError::UnknownProtocolDiscriminator(_)
            | NasError::EventChannelClosed => ErrorClass::Fatal,
        }
    }
}

// ============================================================================
// Security Header Type
// ============================================================================

/// Protection mode carried in the high nibble of the first NAS octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityHeaderType {
    PlainNas = 0,
    IntegrityProtected = 1,
    IntegrityProtectedAndCiphered = 2,
    IntegrityProtectedWithNewSecurityContext = 3,
    IntegrityProtectedAndCipheredWithNewSecurityContext = 4,
    ServiceRequest = 12,
}

impl SecurityHeaderType {
    pub const ALL: [SecurityHeaderType; 6] = [
        SecurityHeaderType::PlainNas,
        SecurityHeaderType::IntegrityProtected,
        SecurityHeaderType::IntegrityProtectedAndCiphered,
        SecurityHeaderType::IntegrityProtectedWithNewSecurityContext,
        SecurityHeaderType::IntegrityProtectedAndCipheredWithNewSecurityContext,
        SecurityHeaderType::ServiceRequest,
    ];

    /// Capability set of this protection mode
    pub fn flags(&self) -> SecurityHeaderTypeFlags {
        let (integrity_protected, ciphered, new_security_context, service_request) = match self {
            SecurityHeaderType::PlainNas => (false, false, false, false),
            SecurityHeaderType::IntegrityProtected => (true, false, false, false),
            SecurityHeaderType::IntegrityProtectedAndCiphered => (true, true, false, false),
            SecurityHeaderType::IntegrityProtectedWithNewSecurityContext => (true, false, true, false),
            SecurityHeaderType::IntegrityProtectedAndCipheredWithNewSecurityContext => {
                (true, true, true, false)
            }
            SecurityHeaderType::ServiceRequest => (false, false, false, true),
        };
        SecurityHeaderTypeFlags {
            service_request,
            integrity_protected,
            new_security_context,
            ciphered,
        }
    }

    /// Octets stripped in front of the inner NAS message
    pub fn header_len(&self) -> usize {
        if self.flags().integrity_protected {
            NAS_SECURITY_HEADER_LEN
        } else {
            0
        }
    }

    /// Read the security header type from the first octet of a NAS message
    pub fn from_first_octet(octet: u8) -> NasResult<Self> {
        Self::try_from(octet >> 4)
    }
}

impl TryFrom<u8> for SecurityHeaderType {
    type Error = NasError;

    fn try_from(value: u8) -> NasResult<Self> {
        match value {
            0 => Ok(Self::PlainNas),
            1 => Ok(Self::IntegrityProtected),
            2 => Ok(Self::IntegrityProtectedAndCiphered),
            3 => Ok(Self::IntegrityProtectedWithNewSecurityContext),
            4 => Ok(Self::IntegrityProtectedAndCipheredWithNewSecurityContext),
            12 => Ok(Self::ServiceRequest),
            _ => Err(NasError::UnknownSecurityHeaderType(value)),
        }
    }
}

impl fmt::Display for SecurityHeaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags();
        write!(
            f,
            "{}[IP:{} C:{} N:{} SR:{}]",
            *self as u8,
            flags.integrity_protected as u8,
            flags.ciphered as u8,
            flags.new_security_context as u8,
            flags.service_request as u8
        )
    }
}

/// Parsed security header type flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityHeaderTypeFlags {
    /// Service request message
    pub service_request: bool,
    /// Integrity protected
    pub integrity_protected: bool,
    /// New security context
    pub new_security_context: bool,
    /// Ciphered
    pub ciphered: bool,
}

// ============================================================================
// NAS Security Header
// ============================================================================

/// NAS EPS Security Header (6 bytes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NasEpsSecurityHeader {
    /// Security header type (high nibble of octet 0)
    pub security_header_type: u8,
    /// Protocol discriminator (low nibble of octet 0)
    pub protocol_discriminator: u8,
    /// Message authentication code (big-endian)
    pub message_authentication_code: u32,
    /// Sequence number
    pub sequence_number: u8,
}

impl NasEpsSecurityHeader {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NAS_SECURITY_HEADER_LEN {
            return None;
        }
        Some(Self {
            security_header_type: bytes[0] >> 4,
            protocol_discriminator: bytes[0] & 0x0f,
            message_authentication_code: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            sequence_number: bytes[5],
        })
    }
}

// ============================================================================
// Security Context
// ============================================================================

/// UL count structure for tracking overflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UlCount {
    /// Sequence number (8 bits)
    pub sqn: u8,
    /// Overflow counter (16 bits)
    pub overflow: u16,
}

impl UlCount {
    /// Get 32-bit count value
    pub fn to_u32(&self) -> u32 {
        ((self.overflow as u32) << 8) | (self.sqn as u32)
    }

    /// Advance to a received sequence number, bumping overflow on wrap
    pub fn update(&mut self, sqn: u8) {
        if self.sqn > sqn {
            self.overflow = self.overflow.wrapping_add(1);
        }
        self.sqn = sqn;
    }
}

/// Per-UE NAS security context
#[derive(Debug, Clone, Default)]
pub struct NasSecurityContext {
    /// Set once a security mode procedure completed
    pub available: bool,
    /// Selected EIA algorithm
    pub selected_int_algorithm: u8,
    /// Selected EEA algorithm
    pub selected_enc_algorithm: u8,
    /// NAS integrity key
    pub knas_int: [u8; 16],
    /// NAS ciphering key
    pub knas_enc: [u8; 16],
    /// Uplink NAS COUNT
    pub ul_count: UlCount,
    /// Last MAC check failed
    pub mac_failed: bool,
}

// ============================================================================
// Security engine
// ============================================================================

/// Verifies and deciphers an uplink NAS message in place.
///
/// On entry `pkbuf` holds the inner NAS message; for integrity protected
/// types the stripped 6-octet security header sits right in front of it,
/// in the headroom.
pub trait NasSecurityEngine {
    fn decode(
        &self,
        security: &mut NasSecurityContext,
        security_header_type: SecurityHeaderType,
        pkbuf: &mut OgsPkbuf,
    ) -> NasResult<()>;
}

/// Null algorithm engine (EIA0/EEA0)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNasSecurity;

impl NullNasSecurity {
    fn check_algorithms(security: &NasSecurityContext) -> NasResult<()> {
        if security.selected_int_algorithm != OGS_NAS_SECURITY_ALGORITHMS_NULL
            || security.selected_enc_algorithm != OGS_NAS_SECURITY_ALGORITHMS_NULL
        {
            return Err(NasError::UnsupportedAlgorithm {
                int: security.selected_int_algorithm,
                enc: security.selected_enc_algorithm,
            });
        }
        Ok(())
    }

    /// Service request carries KSI + 5-bit SQN in octet 1 and a short MAC
    /// in octets 2..4.
    fn decode_service_request(security: &mut NasSecurityContext, pkbuf: &OgsPkbuf) -> NasResult<()> {
        let data = pkbuf.data();
        if data.len() < 4 {
            return Err(NasError::Truncated {
                needed: 4,
                available: data.len(),
            });
        }

        let estimated_sqn = data[1] & 0x1f;
        let ul_count = security.ul_count;
        let mut sqn = (ul_count.sqn & 0xe0).wrapping_add(estimated_sqn);
        if (ul_count.sqn & 0x1f) > estimated_sqn {
            sqn = sqn.wrapping_add(0x20);
        }
        security.ul_count.update(sqn);

        // EIA0 MAC is all zero
        security.mac_failed = data[2] != 0 || data[3] != 0;
        if security.mac_failed {
            log::warn!("NAS MAC verification failed({:02x}{:02x} != 0000)", data[2], data[3]);
        }
        Ok(())
    }
}

impl NasSecurityEngine for NullNasSecurity {
    fn decode(
        &self,
        security: &mut NasSecurityContext,
        security_header_type: SecurityHeaderType,
        pkbuf: &mut OgsPkbuf,
    ) -> NasResult<()> {
        if !security.available {
            return Ok(());
        }
        Self::check_algorithms(security)?;

        let flags = security_header_type.flags();
        if flags.service_request {
            return Self::decode_service_request(security, pkbuf);
        }

        if flags.new_security_context {
            security.ul_count = UlCount::default();
        }

        if flags.integrity_protected {
            let header = pkbuf
                .headroom_bytes(NAS_SECURITY_HEADER_LEN)
                .and_then(NasEpsSecurityHeader::decode)
                .ok_or_else(|| NasError::SecurityDecode("security header not in headroom".into()))?;

            security.ul_count.update(header.sequence_number);

            security.mac_failed = header.message_authentication_code != 0;
            if security.mac_failed {
                log::warn!(
                    "NAS MAC verification failed(0x{:08x} != 0x00000000)",
                    header.message_authentication_code
                );
            }
        }

        // EEA0 leaves the payload as is
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn protected(sh: u8, sqn: u8, inner: &[u8]) -> OgsPkbuf {
        let mut raw = vec![(sh << 4) | OGS_NAS_PROTOCOL_DISCRIMINATOR_EMM, 0, 0, 0, 0, sqn];
        raw.extend_from_slice(inner);
        let mut pkbuf = OgsPkbuf::alloc(OGS_NAS_HEADROOM, &raw);
        pkbuf.pull(NAS_SECURITY_HEADER_LEN).unwrap();
        pkbuf
    }

    fn null_context() -> NasSecurityContext {
        NasSecurityContext {
            available: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_security_header_type_flags() {
        let flags = SecurityHeaderType::PlainNas.flags();
        assert_eq!(flags, SecurityHeaderTypeFlags::default());

        let flags = SecurityHeaderType::IntegrityProtected.flags();
        assert!(flags.integrity_protected);
        assert!(!flags.ciphered);

        let flags = SecurityHeaderType::IntegrityProtectedAndCiphered.flags();
        assert!(flags.integrity_protected);
        assert!(flags.ciphered);

        let flags = SecurityHeaderType::IntegrityProtectedWithNewSecurityContext.flags();
        assert!(flags.integrity_protected);
        assert!(flags.new_security_context);
        assert!(!flags.ciphered);

        let flags = SecurityHeaderType::IntegrityProtectedAndCipheredWithNewSecurityContext.flags();
        assert!(flags.integrity_protected);
        assert!(flags.new_security_context);
        assert!(flags.ciphered);

        let flags = SecurityHeaderType::ServiceRequest.flags();
        assert!(flags.service_request);
        assert!(!flags.integrity_protected);
    }

    #[test]
    fn test_header_len() {
        for sh in SecurityHeaderType::ALL {
            let expected = if sh.flags().integrity_protected { 6 } else { 0 };
            assert_eq!(sh.header_len(), expected, "{}", sh);
        }
        assert_eq!(SecurityHeaderType::PlainNas.header_len(), 0);
        assert_eq!(SecurityHeaderType::ServiceRequest.header_len(), 0);
    }

    #[test]
    fn test_try_from_round_trips_known_values() {
        for sh in SecurityHeaderType::ALL {
            assert_eq!(SecurityHeaderType::try_from(sh as u8), Ok(sh));
        }
    }

    #[test]
    fn test_unknown_header_types_rejected() {
        for value in [5u8, 6, 7, 8, 11, 13, 15] {
            assert_eq!(
                SecurityHeaderType::try_from(value),
                Err(NasError::UnknownSecurityHeaderType(value))
            );
        }
        assert_eq!(
            SecurityHeaderType::from_first_octet(0x57),
            Err(NasError::UnknownSecurityHeaderType(5))
        );
        assert_eq!(
            SecurityHeaderType::from_first_octet(0x27),
            Ok(SecurityHeaderType::IntegrityProtectedAndCiphered)
        );
    }

    #[test]
    fn test_security_header_decode() {
        let decoded = NasEpsSecurityHeader::decode(&[0x27, 0x12, 0x34, 0x56, 0x78, 0xab]).unwrap();
        assert_eq!(decoded.security_header_type, 2);
        assert_eq!(decoded.protocol_discriminator, 0x07);
        assert_eq!(decoded.message_authentication_code, 0x12345678);
        assert_eq!(decoded.sequence_number, 0xab);
        assert!(NasEpsSecurityHeader::decode(&[0x27, 0x12]).is_none());
    }

    #[test]
    fn test_ul_count() {
        let mut count = UlCount { sqn: 0x12, overflow: 0x0034 };
        assert_eq!(count.to_u32(), 0x003412);

        count.update(0x20);
        assert_eq!(count.to_u32(), 0x003420);
        count.update(0x01);
        assert_eq!(count, UlCount { sqn: 0x01, overflow: 0x0035 });
    }

    #[test]
    fn test_null_engine_without_context_is_noop() {
        let mut security = NasSecurityContext::default();
        let mut pkbuf = protected(1, 9, &[0x07, 0x45]);
        NullNasSecurity
            .decode(&mut security, SecurityHeaderType::IntegrityProtected, &mut pkbuf)
            .unwrap();
        assert_eq!(security.ul_count, UlCount::default());
        assert_eq!(pkbuf.data(), &[0x07, 0x45]);
    }

    #[test]
    fn test_null_engine_tracks_sqn() {
        let mut security = null_context();
        security.ul_count = UlCount { sqn: 0xfe, overflow: 1 };

        let mut pkbuf = protected(2, 0x03, &[0x07, 0x45]);
        NullNasSecurity
            .decode(&mut security, SecurityHeaderType::IntegrityProtectedAndCiphered, &mut pkbuf)
            .unwrap();
        assert_eq!(security.ul_count, UlCount { sqn: 0x03, overflow: 2 });
        assert!(!security.mac_failed);
        assert_eq!(pkbuf.data(), &[0x07, 0x45]);
    }

    #[test]
    fn test_null_engine_new_context_resets_count() {
        let mut security = null_context();
        security.ul_count = UlCount { sqn: 0x40, overflow: 7 };

        let mut pkbuf = protected(3, 0x00, &[0x07, 0x5e]);
        NullNasSecurity
            .decode(
                &mut security,
                SecurityHeaderType::IntegrityProtectedWithNewSecurityContext,
                &mut pkbuf,
            )
            .unwrap();
        assert_eq!(security.ul_count, UlCount::default());
    }

    #[test]
    fn test_null_engine_flags_nonzero_mac() {
        let mut security = null_context();
        let raw = [0x17, 0xde, 0xad, 0xbe, 0xef, 0x01, 0x07, 0x45];
        let mut pkbuf = OgsPkbuf::alloc(OGS_NAS_HEADROOM, &raw);
        pkbuf.pull(6).unwrap();

        NullNasSecurity
            .decode(&mut security, SecurityHeaderType::IntegrityProtected, &mut pkbuf)
            .unwrap();
        assert!(security.mac_failed);
    }

    #[test]
    fn test_null_engine_rejects_real_algorithms() {
        let mut security = null_context();
        security.selected_int_algorithm = 2;
        let mut pkbuf = protected(1, 0, &[0x07, 0x45]);
        assert_eq!(
            NullNasSecurity.decode(&mut security, SecurityHeaderType::IntegrityProtected, &mut pkbuf),
            Err(NasError::UnsupportedAlgorithm { int: 2, enc: 0 })
        );
    }

    #[test]
    fn test_null_engine_service_request() {
        let mut security = null_context();
        security.ul_count = UlCount { sqn: 0x3e, overflow: 0 };

        // KSI 0, SQN 0x02 wraps the low five bits
        let mut pkbuf = OgsPkbuf::alloc(OGS_NAS_HEADROOM, &[0xc7, 0x02, 0x00, 0x00]);
        NullNasSecurity
            .decode(&mut security, SecurityHeaderType::ServiceRequest, &mut pkbuf)
            .unwrap();
        assert_eq!(security.ul_count, UlCount { sqn: 0x42, overflow: 0 });
        assert!(!security.mac_failed);
    }

    #[test]
    fn test_null_engine_short_service_request() {
        let mut security = null_context();
        let mut pkbuf = OgsPkbuf::alloc(OGS_NAS_HEADROOM, &[0xc7, 0x02]);
        assert_eq!(
            NullNasSecurity.decode(&mut security, SecurityHeaderType::ServiceRequest, &mut pkbuf),
            Err(NasError::Truncated { needed: 4, available: 2 })
        );
    }
}

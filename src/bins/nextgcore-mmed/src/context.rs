//! MME Context Management
//!
//! eNB, eNB-UE, MME-UE and session storage with the lookup tables used by
//! the S1AP and S11 handlers. Every object lives in an `OgsPool` and is
//! referenced by its generation-checked handle, so a handle kept across a
//! release never reaches the context that later reuses the slot.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use ogs_core::{ogs_next_id, OgsPool, OgsPoolId, PoolError};
use thiserror::Error;

use crate::config::MmeConfig;
use crate::error::ErrorClass;
use crate::nas_security::NasSecurityContext;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of sessions per UE
pub const OGS_MAX_NUM_OF_SESS: usize = 4;
/// Maximum number of bearers per session
pub const OGS_MAX_NUM_OF_BEARER: usize = 8;

/// Invalid UE S1AP ID
pub const INVALID_UE_S1AP_ID: u32 = 0xffffffff;
/// MME-UE-S1AP-ID range
pub const MIN_MME_UE_S1AP_ID: u32 = 1;
pub const MAX_MME_UE_S1AP_ID: u32 = INVALID_UE_S1AP_ID - 1;

/// Minimum EPS bearer ID
pub const MIN_EPS_BEARER_ID: u8 = 5;
/// Maximum EPS bearer ID
pub const MAX_EPS_BEARER_ID: u8 = 15;

pub type EnbId = OgsPoolId<MmeEnb>;
pub type EnbUeId = OgsPoolId<EnbUe>;
pub type MmeUeId = OgsPoolId<MmeUe>;
pub type SessId = OgsPoolId<MmeSess>;

/// Context errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("no eNB context {0:?}")]
    EnbNotFound(EnbId),
    #[error("no eNB UE context {0:?}")]
    EnbUeNotFound(EnbUeId),
    #[error("no MME UE context {0:?}")]
    MmeUeNotFound(MmeUeId),
    #[error("no session context {0:?}")]
    SessNotFound(SessId),
    #[error("too many sessions for UE {0}")]
    TooManySessions(String),
    #[error("too many bearers in session (EBI:{0})")]
    TooManyBearers(u8),
    #[error("MME-UE-S1AP-ID space exhausted")]
    S1apIdExhausted,
}

pub type ContextResult<T> = Result<T, ContextError>;

impl ContextError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ContextError::EnbNotFound(_)
            | ContextError::EnbUeNotFound(_)
            | ContextError::MmeUeNotFound(_)
            | ContextError::SessNotFound(_) => ErrorClass::NotFound,
            ContextError::Pool(_)
            | ContextError::TooManySessions(_)
            | ContextError::TooManyBearers(_)
            | ContextError::S1apIdExhausted => ErrorClass::Fatal,
        }
    }
}

// ============================================================================
// Basic Types
// ============================================================================

/// PLMN ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    pub mcc1: u8,
    pub mcc2: u8,
    pub mcc3: u8,
    pub mnc1: u8,
    pub mnc2: u8,
    /// MNC digit 3 (0xf if 2-digit MNC)
    pub mnc3: u8,
}

impl PlmnId {
    /// Create a PLMN ID from decimal MCC/MNC strings
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let mcc_digits: Vec<u8> = mcc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();
        let mnc_digits: Vec<u8> = mnc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();

        Self {
            mcc1: mcc_digits.first().copied().unwrap_or(0),
            mcc2: mcc_digits.get(1).copied().unwrap_or(0),
            mcc3: mcc_digits.get(2).copied().unwrap_or(0),
            mnc1: mnc_digits.first().copied().unwrap_or(0),
            mnc2: mnc_digits.get(1).copied().unwrap_or(0),
            mnc3: mnc_digits.get(2).copied().unwrap_or(0xf),
        }
    }

    /// Decode the 3-octet TBCD form used on S1AP and NAS
    pub fn from_octets(octets: [u8; 3]) -> Self {
        Self {
            mcc1: octets[0] & 0x0f,
            mcc2: octets[0] >> 4,
            mcc3: octets[1] & 0x0f,
            mnc3: octets[1] >> 4,
            mnc1: octets[2] & 0x0f,
            mnc2: octets[2] >> 4,
        }
    }

    /// Encode to the 3-octet TBCD form
    pub fn to_octets(&self) -> [u8; 3] {
        [
            (self.mcc2 << 4) | (self.mcc1 & 0x0f),
            (self.mnc3 << 4) | (self.mcc3 & 0x0f),
            (self.mnc2 << 4) | (self.mnc1 & 0x0f),
        ]
    }
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}-{}{}", self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2)?;
        if self.mnc3 != 0xf {
            write!(f, "{}", self.mnc3)?;
        }
        Ok(())
    }
}

/// EPS TAI (Tracking Area Identity)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EpsTai {
    pub plmn_id: PlmnId,
    /// TAC (host order)
    pub tac: u16,
}

/// E-CGI (E-UTRAN Cell Global Identity)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ECgi {
    pub plmn_id: PlmnId,
    /// E-UTRAN Cell ID (28 bits)
    pub cell_id: u32,
}

/// EPS GUTI
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    pub plmn_id: PlmnId,
    /// MME Group ID
    pub mme_gid: u16,
    /// MME Code
    pub mme_code: u8,
    /// M-TMSI
    pub m_tmsi: u32,
}

impl fmt::Display for EpsGuti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:04x}:{:02x}:0x{:08x}",
            self.plmn_id, self.mme_gid, self.mme_code, self.m_tmsi
        )
    }
}

/// Transport layer address (IPv4, IPv6 or both)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAddr {
    pub ipv4: Option<[u8; 4]>,
    pub ipv6: Option<[u8; 16]>,
}

impl IpAddr {
    /// Decode an S1AP TransportLayerAddress bit string (32, 128 or 160 bits)
    pub fn from_transport_layer_address(octets: &[u8]) -> Option<Self> {
        match octets.len() {
            4 => Some(Self {
                ipv4: octets.try_into().ok(),
                ipv6: None,
            }),
            16 => Some(Self {
                ipv4: None,
                ipv6: octets.try_into().ok(),
            }),
            20 => Some(Self {
                ipv4: octets[..4].try_into().ok(),
                ipv6: octets[4..].try_into().ok(),
            }),
            _ => None,
        }
    }
}

// ============================================================================
// eNB Context
// ============================================================================

/// eNB context
#[derive(Debug, Clone)]
pub struct MmeEnb {
    /// S1AP association peer
    pub addr: SocketAddr,
    /// eNB ID, known after S1 Setup
    pub enb_id: Option<u32>,
    /// Supported TA list
    pub supported_ta_list: Vec<EpsTai>,
    /// eNB-UE-S1AP-ID to eNB UE
    pub enb_ue_hash: HashMap<u32, EnbUeId>,
}

impl MmeEnb {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            enb_id: None,
            supported_ta_list: Vec::new(),
            enb_ue_hash: HashMap::new(),
        }
    }

    pub fn supports_tai(&self, tai: &EpsTai) -> bool {
        self.supported_ta_list.iter().any(|t| t == tai)
    }
}

// ============================================================================
// eNB UE Context
// ============================================================================

/// UE context as seen at one eNB
#[derive(Debug, Clone)]
pub struct EnbUe {
    /// Owning eNB
    pub enb: EnbId,
    /// eNB UE S1AP ID (unique within `enb`)
    pub enb_ue_s1ap_id: u32,
    /// MME UE S1AP ID (assigned by MME)
    pub mme_ue_s1ap_id: u32,
    /// TAI from the last InitialUEMessage
    pub tai: EpsTai,
    /// E-CGI from the last InitialUEMessage
    pub e_cgi: ECgi,
    /// Associated MME UE
    pub mme_ue: Option<MmeUeId>,
}

// ============================================================================
// MME UE Context
// ============================================================================

/// Core UE context
#[derive(Debug, Clone, Default)]
pub struct MmeUe {
    pub imsi_bcd: String,
    pub guti: Option<EpsGuti>,
    /// Last known tracking area
    pub tai: EpsTai,
    pub security: NasSecurityContext,
    /// UE radio capability, as received
    pub ue_radio_capability: Option<Bytes>,
    /// Sessions, in creation order
    pub sess_list: Vec<SessId>,
    /// Last built Paging message
    pub last_paging_msg: Option<Bytes>,
    /// Serving gateway (S11 peer)
    pub sgw: Option<SocketAddr>,
    /// MME S11 TEID
    pub mme_s11_teid: u32,
    /// Associated eNB UE
    pub enb_ue: Option<EnbUeId>,
    /// A Release Access Bearers request of the current batch was refused
    /// or never answered
    pub release_access_bearers_failed: bool,
}

impl MmeUe {
    /// Drop the cached Paging message; the next paging cycle rebuilds it
    pub fn clear_paging_cache(&mut self) {
        self.last_paging_msg = None;
    }

    pub fn has_session(&self) -> bool {
        !self.sess_list.is_empty()
    }
}

// ============================================================================
// Session / Bearer
// ============================================================================

/// EPS bearer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MmeBearer {
    /// EPS Bearer ID
    pub ebi: u8,
    /// eNB S1-U TEID
    pub enb_s1u_teid: u32,
    /// eNB S1-U address
    pub enb_s1u_addr: Option<IpAddr>,
    /// SGW S1-U TEID
    pub sgw_s1u_teid: u32,
    /// SGW S1-U address
    pub sgw_s1u_addr: Option<IpAddr>,
}

/// PDN session
#[derive(Debug, Clone)]
pub struct MmeSess {
    /// Owning UE
    pub mme_ue: MmeUeId,
    /// Procedure transaction identity
    pub pti: u8,
    /// SGW S11 TEID
    pub sgw_s11_teid: u32,
    /// Bearers; the first one is the default bearer
    bearer_list: Vec<MmeBearer>,
}

impl MmeSess {
    pub fn default_bearer(&self) -> &MmeBearer {
        &self.bearer_list[0]
    }

    pub fn default_bearer_mut(&mut self) -> &mut MmeBearer {
        &mut self.bearer_list[0]
    }

    pub fn bearers(&self) -> &[MmeBearer] {
        &self.bearer_list
    }

    pub fn find_bearer_by_ebi(&self, ebi: u8) -> Option<&MmeBearer> {
        self.bearer_list.iter().find(|b| b.ebi == ebi)
    }
}

// ============================================================================
// MME Context
// ============================================================================

/// MME context
#[derive(Debug)]
pub struct MmeContext {
    enb_pool: OgsPool<MmeEnb>,
    enb_ue_pool: OgsPool<EnbUe>,
    mme_ue_pool: OgsPool<MmeUe>,
    sess_pool: OgsPool<MmeSess>,

    /// S1AP association address to eNB
    enb_addr_hash: HashMap<SocketAddr, EnbId>,
    /// eNB ID to eNB
    enb_id_hash: HashMap<u32, EnbId>,
    /// MME-UE-S1AP-ID to eNB UE
    mme_ue_s1ap_id_hash: HashMap<u32, EnbUeId>,
    /// GUTI to MME UE
    guti_ue_hash: HashMap<EpsGuti, MmeUeId>,
    /// IMSI to MME UE
    imsi_ue_hash: HashMap<String, MmeUeId>,

    /// Last assigned MME-UE-S1AP-ID
    mme_ue_s1ap_id: u32,
    /// Serving gateways, round-robin
    sgw_list: Vec<SocketAddr>,
    sgw_next: usize,
}

impl MmeContext {
    pub fn new(config: &MmeConfig) -> Self {
        Self::with_capacity(config.max_enb, config.max_ue, config.sgw.clone())
    }

    pub fn with_capacity(max_enb: usize, max_ue: usize, sgw_list: Vec<SocketAddr>) -> Self {
        Self {
            enb_pool: OgsPool::new("mme_enb", max_enb),
            enb_ue_pool: OgsPool::new("enb_ue", max_ue),
            mme_ue_pool: OgsPool::new("mme_ue", max_ue),
            sess_pool: OgsPool::new("mme_sess", max_ue * OGS_MAX_NUM_OF_SESS),
            enb_addr_hash: HashMap::new(),
            enb_id_hash: HashMap::new(),
            mme_ue_s1ap_id_hash: HashMap::new(),
            guti_ue_hash: HashMap::new(),
            imsi_ue_hash: HashMap::new(),
            mme_ue_s1ap_id: 0,
            sgw_list,
            sgw_next: 0,
        }
    }

    // ------------------------------------------------------------------------
    // eNB
    // ------------------------------------------------------------------------

    /// Register a new S1AP association
    pub fn enb_add(&mut self, addr: SocketAddr) -> ContextResult<EnbId> {
        if let Some(id) = self.enb_addr_hash.get(&addr) {
            return Ok(*id);
        }
        let id = self.enb_pool.alloc(MmeEnb::new(addr))?;
        self.enb_addr_hash.insert(addr, id);
        log::info!("[Added] Number of eNBs is now {}", self.enb_pool.len());
        Ok(id)
    }

    /// Drop an eNB together with every eNB UE it owns
    pub fn enb_remove(&mut self, id: EnbId) {
        let Some(enb) = self.enb_pool.free(id) else {
            return;
        };
        for enb_ue in enb.enb_ue_hash.values() {
            self.enb_ue_remove(*enb_ue);
        }
        if self.enb_addr_hash.get(&enb.addr) == Some(&id) {
            self.enb_addr_hash.remove(&enb.addr);
        }
        if let Some(enb_id) = enb.enb_id {
            if self.enb_id_hash.get(&enb_id) == Some(&id) {
                self.enb_id_hash.remove(&enb_id);
            }
        }
        log::info!("[Removed] Number of eNBs is now {}", self.enb_pool.len());
    }

    /// Record the eNB ID received in S1 Setup
    pub fn enb_set_enb_id(&mut self, id: EnbId, enb_id: u32) -> ContextResult<()> {
        let enb = self.enb_pool.get_mut(id).ok_or(ContextError::EnbNotFound(id))?;
        if let Some(old) = enb.enb_id.replace(enb_id) {
            if self.enb_id_hash.get(&old) == Some(&id) {
                self.enb_id_hash.remove(&old);
            }
        }
        if let Some(other) = self.enb_id_hash.insert(enb_id, id) {
            if other != id {
                log::warn!("eNB-id[0x{:x}] already registered by another association", enb_id);
            }
        }
        Ok(())
    }

    pub fn enb(&self, id: EnbId) -> Option<&MmeEnb> {
        self.enb_pool.get(id)
    }

    pub fn enb_mut(&mut self, id: EnbId) -> Option<&mut MmeEnb> {
        self.enb_pool.get_mut(id)
    }

    pub fn enb_find_by_addr(&self, addr: &SocketAddr) -> Option<EnbId> {
        self.enb_addr_hash.get(addr).copied()
    }

    pub fn enb_find_by_enb_id(&self, enb_id: u32) -> Option<EnbId> {
        self.enb_id_hash.get(&enb_id).copied()
    }

    /// eNBs in registration slot order
    pub fn enb_ids(&self) -> Vec<EnbId> {
        self.enb_pool.ids()
    }

    pub fn enb_count(&self) -> usize {
        self.enb_pool.len()
    }

    // ------------------------------------------------------------------------
    // eNB UE
    // ------------------------------------------------------------------------

    fn next_mme_ue_s1ap_id(&mut self) -> ContextResult<u32> {
        for _ in 0..=self.enb_ue_pool.capacity() {
            self.mme_ue_s1ap_id =
                ogs_next_id!(self.mme_ue_s1ap_id, MIN_MME_UE_S1AP_ID, MAX_MME_UE_S1AP_ID);
            if !self.mme_ue_s1ap_id_hash.contains_key(&self.mme_ue_s1ap_id) {
                return Ok(self.mme_ue_s1ap_id);
            }
        }
        Err(ContextError::S1apIdExhausted)
    }

    /// Create an eNB UE bound to `enb` and assign its MME-UE-S1AP-ID
    pub fn enb_ue_add(&mut self, enb: EnbId, enb_ue_s1ap_id: u32) -> ContextResult<EnbUeId> {
        if !self.enb_pool.contains(enb) {
            return Err(ContextError::EnbNotFound(enb));
        }
        let mme_ue_s1ap_id = self.next_mme_ue_s1ap_id()?;

        let id = self.enb_ue_pool.alloc(EnbUe {
            enb,
            enb_ue_s1ap_id,
            mme_ue_s1ap_id,
            tai: EpsTai::default(),
            e_cgi: ECgi::default(),
            mme_ue: None,
        })?;
        self.mme_ue_s1ap_id_hash.insert(mme_ue_s1ap_id, id);
        if let Some(enb) = self.enb_pool.get_mut(enb) {
            enb.enb_ue_hash.insert(enb_ue_s1ap_id, id);
        }

        log::info!("[Added] Number of eNB-UEs is now {}", self.enb_ue_pool.len());
        Ok(id)
    }

    /// Look up the eNB UE for (`enb`, `enb_ue_s1ap_id`), creating it on a miss.
    ///
    /// The flag is true when a new context was created.
    pub fn enb_ue_find_or_add(
        &mut self,
        enb: EnbId,
        enb_ue_s1ap_id: u32,
    ) -> ContextResult<(EnbUeId, bool)> {
        match self.enb_ue_find_by_enb_ue_s1ap_id(enb, enb_ue_s1ap_id) {
            Some(id) => Ok((id, false)),
            None => Ok((self.enb_ue_add(enb, enb_ue_s1ap_id)?, true)),
        }
    }

    /// Drop an eNB UE and clear its MME UE back-link
    pub fn enb_ue_remove(&mut self, id: EnbUeId) -> Option<EnbUe> {
        let enb_ue = self.enb_ue_pool.free(id)?;

        if self.mme_ue_s1ap_id_hash.get(&enb_ue.mme_ue_s1ap_id) == Some(&id) {
            self.mme_ue_s1ap_id_hash.remove(&enb_ue.mme_ue_s1ap_id);
        }
        if let Some(enb) = self.enb_pool.get_mut(enb_ue.enb) {
            if enb.enb_ue_hash.get(&enb_ue.enb_ue_s1ap_id) == Some(&id) {
                enb.enb_ue_hash.remove(&enb_ue.enb_ue_s1ap_id);
            }
        }
        if let Some(mme_ue) = enb_ue.mme_ue.and_then(|m| self.mme_ue_pool.get_mut(m)) {
            if mme_ue.enb_ue == Some(id) {
                mme_ue.enb_ue = None;
            }
        }

        log::info!("[Removed] Number of eNB-UEs is now {}", self.enb_ue_pool.len());
        Some(enb_ue)
    }

    pub fn enb_ue(&self, id: EnbUeId) -> Option<&EnbUe> {
        self.enb_ue_pool.get(id)
    }

    pub fn enb_ue_mut(&mut self, id: EnbUeId) -> Option<&mut EnbUe> {
        self.enb_ue_pool.get_mut(id)
    }

    pub fn enb_ue_find_by_enb_ue_s1ap_id(&self, enb: EnbId, enb_ue_s1ap_id: u32) -> Option<EnbUeId> {
        self.enb_pool.get(enb)?.enb_ue_hash.get(&enb_ue_s1ap_id).copied()
    }

    pub fn enb_ue_find_by_mme_ue_s1ap_id(&self, mme_ue_s1ap_id: u32) -> Option<EnbUeId> {
        self.mme_ue_s1ap_id_hash.get(&mme_ue_s1ap_id).copied()
    }

    pub fn enb_ue_count(&self) -> usize {
        self.enb_ue_pool.len()
    }

    // ------------------------------------------------------------------------
    // MME UE
    // ------------------------------------------------------------------------

    /// Create a core UE context for `imsi_bcd` and pick its serving gateway
    pub fn mme_ue_add(&mut self, imsi_bcd: &str) -> ContextResult<MmeUeId> {
        let sgw = if self.sgw_list.is_empty() {
            None
        } else {
            let sgw = self.sgw_list[self.sgw_next % self.sgw_list.len()];
            self.sgw_next = self.sgw_next.wrapping_add(1);
            Some(sgw)
        };

        let id = self.mme_ue_pool.alloc(MmeUe {
            imsi_bcd: imsi_bcd.to_string(),
            sgw,
            ..Default::default()
        })?;
        if let Some(mme_ue) = self.mme_ue_pool.get_mut(id) {
            mme_ue.mme_s11_teid = id.index() as u32 + 1;
        }
        if !imsi_bcd.is_empty() {
            self.imsi_ue_hash.insert(imsi_bcd.to_string(), id);
        }

        log::info!("[Added] Number of MME-UEs is now {}", self.mme_ue_pool.len());
        Ok(id)
    }

    /// Drop a core UE context with its sessions and index entries
    pub fn mme_ue_remove(&mut self, id: MmeUeId) -> Option<MmeUe> {
        let mme_ue = self.mme_ue_pool.free(id)?;

        for sess in &mme_ue.sess_list {
            self.sess_pool.free(*sess);
        }
        if let Some(guti) = &mme_ue.guti {
            if self.guti_ue_hash.get(guti) == Some(&id) {
                self.guti_ue_hash.remove(guti);
            }
        }
        if self.imsi_ue_hash.get(&mme_ue.imsi_bcd) == Some(&id) {
            self.imsi_ue_hash.remove(&mme_ue.imsi_bcd);
        }
        if let Some(enb_ue) = mme_ue.enb_ue.and_then(|e| self.enb_ue_pool.get_mut(e)) {
            if enb_ue.mme_ue == Some(id) {
                enb_ue.mme_ue = None;
            }
        }

        log::info!("[Removed] Number of MME-UEs is now {}", self.mme_ue_pool.len());
        Some(mme_ue)
    }

    /// Assign a GUTI and index it
    pub fn mme_ue_set_guti(&mut self, id: MmeUeId, guti: EpsGuti) -> ContextResult<()> {
        let mme_ue = self.mme_ue_pool.get_mut(id).ok_or(ContextError::MmeUeNotFound(id))?;
        if let Some(old) = mme_ue.guti.replace(guti.clone()) {
            if self.guti_ue_hash.get(&old) == Some(&id) {
                self.guti_ue_hash.remove(&old);
            }
        }
        self.guti_ue_hash.insert(guti, id);
        Ok(())
    }

    pub fn mme_ue(&self, id: MmeUeId) -> Option<&MmeUe> {
        self.mme_ue_pool.get(id)
    }

    pub fn mme_ue_mut(&mut self, id: MmeUeId) -> Option<&mut MmeUe> {
        self.mme_ue_pool.get_mut(id)
    }

    pub fn mme_ue_find_by_guti(&self, guti: &EpsGuti) -> Option<MmeUeId> {
        self.guti_ue_hash.get(guti).copied()
    }

    pub fn mme_ue_find_by_imsi_bcd(&self, imsi_bcd: &str) -> Option<MmeUeId> {
        self.imsi_ue_hash.get(imsi_bcd).copied()
    }

    pub fn mme_ue_count(&self) -> usize {
        self.mme_ue_pool.len()
    }

    /// MME UE of an eNB UE, when associated and still alive
    pub fn mme_ue_of(&self, enb_ue: EnbUeId) -> Option<MmeUeId> {
        let mme_ue = self.enb_ue_pool.get(enb_ue)?.mme_ue?;
        self.mme_ue_pool.contains(mme_ue).then_some(mme_ue)
    }

    /// Link `mme_ue` and `enb_ue`, unlinking whatever each was linked to
    pub fn associate(&mut self, mme_ue: MmeUeId, enb_ue: EnbUeId) -> ContextResult<()> {
        if !self.mme_ue_pool.contains(mme_ue) {
            return Err(ContextError::MmeUeNotFound(mme_ue));
        }
        let previous_mme_ue = self
            .enb_ue_pool
            .get(enb_ue)
            .ok_or(ContextError::EnbUeNotFound(enb_ue))?
            .mme_ue;

        if let Some(old) = previous_mme_ue.filter(|m| *m != mme_ue) {
            if let Some(old) = self.mme_ue_pool.get_mut(old) {
                if old.enb_ue == Some(enb_ue) {
                    old.enb_ue = None;
                }
            }
        }

        let previous_enb_ue = self.mme_ue_pool.get(mme_ue).and_then(|m| m.enb_ue);
        if let Some(old) = previous_enb_ue.filter(|e| *e != enb_ue) {
            if let Some(old) = self.enb_ue_pool.get_mut(old) {
                old.mme_ue = None;
            }
        }

        if let Some(e) = self.enb_ue_pool.get_mut(enb_ue) {
            e.mme_ue = Some(mme_ue);
        }
        if let Some(m) = self.mme_ue_pool.get_mut(mme_ue) {
            m.enb_ue = Some(enb_ue);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Session / Bearer
    // ------------------------------------------------------------------------

    /// Create a session with its default bearer
    pub fn sess_add(&mut self, mme_ue: MmeUeId, pti: u8, default_ebi: u8) -> ContextResult<SessId> {
        let ue = self.mme_ue_pool.get(mme_ue).ok_or(ContextError::MmeUeNotFound(mme_ue))?;
        if ue.sess_list.len() >= OGS_MAX_NUM_OF_SESS {
            return Err(ContextError::TooManySessions(ue.imsi_bcd.clone()));
        }

        let id = self.sess_pool.alloc(MmeSess {
            mme_ue,
            pti,
            sgw_s11_teid: 0,
            bearer_list: vec![MmeBearer {
                ebi: default_ebi,
                ..Default::default()
            }],
        })?;
        if let Some(ue) = self.mme_ue_pool.get_mut(mme_ue) {
            ue.sess_list.push(id);
        }
        Ok(id)
    }

    /// Add a dedicated bearer to a session
    pub fn bearer_add(&mut self, sess: SessId, ebi: u8) -> ContextResult<()> {
        let s = self.sess_pool.get_mut(sess).ok_or(ContextError::SessNotFound(sess))?;
        if s.bearer_list.len() >= OGS_MAX_NUM_OF_BEARER {
            return Err(ContextError::TooManyBearers(ebi));
        }
        s.bearer_list.push(MmeBearer {
            ebi,
            ..Default::default()
        });
        Ok(())
    }

    pub fn sess_remove(&mut self, id: SessId) -> Option<MmeSess> {
        let sess = self.sess_pool.free(id)?;
        if let Some(ue) = self.mme_ue_pool.get_mut(sess.mme_ue) {
            ue.sess_list.retain(|s| *s != id);
        }
        Some(sess)
    }

    pub fn sess(&self, id: SessId) -> Option<&MmeSess> {
        self.sess_pool.get(id)
    }

    pub fn sess_mut(&mut self, id: SessId) -> Option<&mut MmeSess> {
        self.sess_pool.get_mut(id)
    }

    /// Session of `mme_ue` carrying procedure transaction `pti`
    pub fn sess_find_by_pti(&self, mme_ue: MmeUeId, pti: u8) -> Option<SessId> {
        self.mme_ue_pool
            .get(mme_ue)?
            .sess_list
            .iter()
            .copied()
            .find(|s| self.sess_pool.get(*s).is_some_and(|sess| sess.pti == pti))
    }

    /// Session of `mme_ue` owning the bearer `ebi`
    pub fn sess_find_by_ebi(&self, mme_ue: MmeUeId, ebi: u8) -> Option<SessId> {
        self.mme_ue_pool
            .get(mme_ue)?
            .sess_list
            .iter()
            .copied()
            .find(|s| {
                self.sess_pool
                    .get(*s)
                    .is_some_and(|sess| sess.find_bearer_by_ebi(ebi).is_some())
            })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, last], 36412))
    }

    fn context() -> MmeContext {
        MmeContext::with_capacity(4, 8, vec![SocketAddr::from(([127, 0, 0, 3], 2123))])
    }

    #[test]
    fn test_plmn_id_octets() {
        let plmn_id = PlmnId::new("001", "01");
        assert_eq!(plmn_id.to_octets(), [0x00, 0xf1, 0x10]);
        assert_eq!(PlmnId::from_octets([0x00, 0xf1, 0x10]), plmn_id);

        let plmn_id = PlmnId::new("310", "410");
        assert_eq!(PlmnId::from_octets(plmn_id.to_octets()), plmn_id);
        assert_eq!(plmn_id.to_string(), "310-410");
    }

    #[test]
    fn test_transport_layer_address() {
        let v4 = IpAddr::from_transport_layer_address(&[10, 0, 0, 1]).unwrap();
        assert_eq!(v4.ipv4, Some([10, 0, 0, 1]));
        assert!(v4.ipv6.is_none());

        let both = IpAddr::from_transport_layer_address(&[1u8; 20]).unwrap();
        assert!(both.ipv4.is_some() && both.ipv6.is_some());

        assert!(IpAddr::from_transport_layer_address(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_enb_add_find_remove() {
        let mut ctx = context();
        let enb = ctx.enb_add(addr(10)).unwrap();
        assert_eq!(ctx.enb_add(addr(10)).unwrap(), enb);
        assert_eq!(ctx.enb_find_by_addr(&addr(10)), Some(enb));

        ctx.enb_set_enb_id(enb, 0x19b).unwrap();
        assert_eq!(ctx.enb_find_by_enb_id(0x19b), Some(enb));

        ctx.enb_remove(enb);
        assert!(ctx.enb(enb).is_none());
        assert!(ctx.enb_find_by_addr(&addr(10)).is_none());
        assert!(ctx.enb_find_by_enb_id(0x19b).is_none());
    }

    #[test]
    fn test_duplicate_enb_id_takes_index() {
        let mut ctx = context();
        let a = ctx.enb_add(addr(10)).unwrap();
        let b = ctx.enb_add(addr(11)).unwrap();
        ctx.enb_set_enb_id(a, 7).unwrap();
        ctx.enb_set_enb_id(b, 7).unwrap();
        assert_eq!(ctx.enb_find_by_enb_id(7), Some(b));

        // Removing the first association leaves the new owner indexed
        ctx.enb_remove(a);
        assert_eq!(ctx.enb_find_by_enb_id(7), Some(b));
    }

    #[test]
    fn test_enb_ue_find_or_add_idempotent() {
        let mut ctx = context();
        let enb = ctx.enb_add(addr(10)).unwrap();

        let (first, created) = ctx.enb_ue_find_or_add(enb, 5).unwrap();
        assert!(created);
        let (second, created) = ctx.enb_ue_find_or_add(enb, 5).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(ctx.enb_ue_count(), 1);
    }

    #[test]
    fn test_enb_ue_s1ap_id_scoped_per_enb() {
        let mut ctx = context();
        let a = ctx.enb_add(addr(10)).unwrap();
        let b = ctx.enb_add(addr(11)).unwrap();

        let (ue_a, _) = ctx.enb_ue_find_or_add(a, 1).unwrap();
        let (ue_b, _) = ctx.enb_ue_find_or_add(b, 1).unwrap();
        assert_ne!(ue_a, ue_b);

        let id_a = ctx.enb_ue(ue_a).unwrap().mme_ue_s1ap_id;
        let id_b = ctx.enb_ue(ue_b).unwrap().mme_ue_s1ap_id;
        assert_ne!(id_a, id_b);
        assert_eq!(ctx.enb_ue_find_by_mme_ue_s1ap_id(id_a), Some(ue_a));
        assert_eq!(ctx.enb_ue_find_by_mme_ue_s1ap_id(id_b), Some(ue_b));
    }

    #[test]
    fn test_enb_ue_remove_clears_indexes() {
        let mut ctx = context();
        let enb = ctx.enb_add(addr(10)).unwrap();
        let enb_ue = ctx.enb_ue_add(enb, 9).unwrap();
        let mme_ue_s1ap_id = ctx.enb_ue(enb_ue).unwrap().mme_ue_s1ap_id;
        let mme_ue = ctx.mme_ue_add("001010000000001").unwrap();
        ctx.associate(mme_ue, enb_ue).unwrap();

        ctx.enb_ue_remove(enb_ue).unwrap();
        assert!(ctx.enb_ue_find_by_mme_ue_s1ap_id(mme_ue_s1ap_id).is_none());
        assert!(ctx.enb_ue_find_by_enb_ue_s1ap_id(enb, 9).is_none());
        assert!(ctx.mme_ue(mme_ue).unwrap().enb_ue.is_none());
        assert!(ctx.enb_ue_remove(enb_ue).is_none());
    }

    #[test]
    fn test_stale_enb_ue_handle_after_reuse() {
        let mut ctx = context();
        let enb = ctx.enb_add(addr(10)).unwrap();
        let old = ctx.enb_ue_add(enb, 1).unwrap();
        ctx.enb_ue_remove(old);

        let new = ctx.enb_ue_add(enb, 2).unwrap();
        assert!(ctx.enb_ue(old).is_none());
        assert_eq!(ctx.enb_ue(new).unwrap().enb_ue_s1ap_id, 2);
    }

    #[test]
    fn test_enb_remove_drops_its_ues() {
        let mut ctx = context();
        let enb = ctx.enb_add(addr(10)).unwrap();
        let ue1 = ctx.enb_ue_add(enb, 1).unwrap();
        let ue2 = ctx.enb_ue_add(enb, 2).unwrap();

        ctx.enb_remove(enb);
        assert!(ctx.enb_ue(ue1).is_none());
        assert!(ctx.enb_ue(ue2).is_none());
        assert_eq!(ctx.enb_ue_count(), 0);
    }

    #[test]
    fn test_enb_ue_add_unknown_enb() {
        let mut ctx = context();
        let enb = ctx.enb_add(addr(10)).unwrap();
        ctx.enb_remove(enb);
        assert_eq!(ctx.enb_ue_add(enb, 1), Err(ContextError::EnbNotFound(enb)));
    }

    #[test]
    fn test_enb_ue_pool_exhausted() {
        let mut ctx = MmeContext::with_capacity(1, 1, vec![]);
        let enb = ctx.enb_add(addr(10)).unwrap();
        ctx.enb_ue_add(enb, 1).unwrap();
        assert!(matches!(ctx.enb_ue_add(enb, 2), Err(ContextError::Pool(_))));
    }

    #[test]
    fn test_guti_index() {
        let mut ctx = context();
        let mme_ue = ctx.mme_ue_add("001010000000001").unwrap();
        let guti = EpsGuti {
            plmn_id: PlmnId::new("001", "01"),
            mme_gid: 2,
            mme_code: 1,
            m_tmsi: 0xc0000001,
        };
        ctx.mme_ue_set_guti(mme_ue, guti.clone()).unwrap();
        assert_eq!(ctx.mme_ue_find_by_guti(&guti), Some(mme_ue));

        let reallocated = EpsGuti {
            m_tmsi: 0xc0000002,
            ..guti.clone()
        };
        ctx.mme_ue_set_guti(mme_ue, reallocated.clone()).unwrap();
        assert!(ctx.mme_ue_find_by_guti(&guti).is_none());
        assert_eq!(ctx.mme_ue_find_by_guti(&reallocated), Some(mme_ue));

        ctx.mme_ue_remove(mme_ue);
        assert!(ctx.mme_ue_find_by_guti(&reallocated).is_none());
        assert!(ctx.mme_ue_find_by_imsi_bcd("001010000000001").is_none());
    }

    #[test]
    fn test_associate_unlinks_previous_enb_ue() {
        let mut ctx = context();
        let enb = ctx.enb_add(addr(10)).unwrap();
        let first = ctx.enb_ue_add(enb, 1).unwrap();
        let second = ctx.enb_ue_add(enb, 2).unwrap();
        let mme_ue = ctx.mme_ue_add("001010000000001").unwrap();

        ctx.associate(mme_ue, first).unwrap();
        ctx.associate(mme_ue, second).unwrap();

        assert!(ctx.enb_ue(first).unwrap().mme_ue.is_none());
        assert_eq!(ctx.enb_ue(second).unwrap().mme_ue, Some(mme_ue));
        assert_eq!(ctx.mme_ue(mme_ue).unwrap().enb_ue, Some(second));
        assert_eq!(ctx.mme_ue_of(second), Some(mme_ue));
    }

    #[test]
    fn test_sgw_round_robin() {
        let sgw1 = SocketAddr::from(([127, 0, 0, 3], 2123));
        let sgw2 = SocketAddr::from(([127, 0, 0, 4], 2123));
        let mut ctx = MmeContext::with_capacity(1, 4, vec![sgw1, sgw2]);
        let a = ctx.mme_ue_add("1").unwrap();
        let b = ctx.mme_ue_add("2").unwrap();
        let c = ctx.mme_ue_add("3").unwrap();
        assert_eq!(ctx.mme_ue(a).unwrap().sgw, Some(sgw1));
        assert_eq!(ctx.mme_ue(b).unwrap().sgw, Some(sgw2));
        assert_eq!(ctx.mme_ue(c).unwrap().sgw, Some(sgw1));
    }

    #[test]
    fn test_sessions() {
        let mut ctx = context();
        let mme_ue = ctx.mme_ue_add("001010000000001").unwrap();
        let s1 = ctx.sess_add(mme_ue, 1, 5).unwrap();
        let s2 = ctx.sess_add(mme_ue, 2, 6).unwrap();
        ctx.bearer_add(s1, 7).unwrap();

        assert_eq!(ctx.sess(s1).unwrap().default_bearer().ebi, 5);
        assert_eq!(ctx.sess(s1).unwrap().bearers().len(), 2);
        assert_eq!(ctx.sess_find_by_pti(mme_ue, 2), Some(s2));
        assert_eq!(ctx.sess_find_by_pti(mme_ue, 3), None);
        assert_eq!(ctx.sess_find_by_ebi(mme_ue, 7), Some(s1));
        assert_eq!(ctx.sess_find_by_ebi(mme_ue, 6), Some(s2));
        assert_eq!(ctx.sess_find_by_ebi(mme_ue, 9), None);

        ctx.sess_remove(s2);
        assert_eq!(ctx.mme_ue(mme_ue).unwrap().sess_list, vec![s1]);

        ctx.mme_ue_remove(mme_ue);
        assert!(ctx.sess(s1).is_none());
    }

    #[test]
    fn test_session_limit() {
        let mut ctx = context();
        let mme_ue = ctx.mme_ue_add("001010000000001").unwrap();
        for pti in 0..OGS_MAX_NUM_OF_SESS as u8 {
            ctx.sess_add(mme_ue, pti, MIN_EPS_BEARER_ID + pti).unwrap();
        }
        assert!(matches!(
            ctx.sess_add(mme_ue, 9, 14),
            Err(ContextError::TooManySessions(_))
        ));
    }

    #[test]
    fn test_paging_cache_clear() {
        let mut ue = MmeUe {
            last_paging_msg: Some(Bytes::from_static(&[1, 2, 3])),
            ..Default::default()
        };
        ue.clear_paging_cache();
        assert!(ue.last_paging_msg.is_none());
    }
}

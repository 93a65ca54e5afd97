//! MME configuration
//!
//! Loads the `mme:` and `sgw:` sections of the YAML configuration file.
//! The file layer (`MmeConfigFile`) mirrors the YAML; `MmeConfig` is the
//! validated, typed form handed to the rest of the MME.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{EpsTai, PlmnId};

/// S1AP SCTP port
pub const OGS_S1AP_SCTP_PORT: u16 = 36412;
/// GTPv2-C UDP port
pub const OGS_GTPV2_C_UDP_PORT: u16 = 2123;

/// Default maximum number of UEs
pub const MAX_NUM_OF_UE: usize = 1024;
/// Default maximum number of eNBs
pub const MAX_NUM_OF_ENB: usize = 64;
/// Default relative MME capacity
pub const DEFAULT_RELATIVE_CAPACITY: u8 = 255;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// File layout
// ============================================================================

/// A single value or a list of them (`mme_gid: 2` or `mme_gid: [2, 3]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// `{ address: ..., port: ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConf {
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// `{ mcc: "001", mnc: "01" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlmnIdConf {
    pub mcc: String,
    pub mnc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GummeiConf {
    pub plmn_id: OneOrMany<PlmnIdConf>,
    pub mme_gid: OneOrMany<u16>,
    pub mme_code: OneOrMany<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaiConf {
    pub plmn_id: PlmnIdConf,
    pub tac: OneOrMany<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmeSectionConf {
    #[serde(default)]
    pub s1ap: Vec<ServerConf>,
    #[serde(default)]
    pub gtpc: Vec<ServerConf>,
    #[serde(default)]
    pub gummei: Vec<GummeiConf>,
    #[serde(default)]
    pub tai: Vec<TaiConf>,
    #[serde(default)]
    pub mme_name: Option<String>,
    #[serde(default)]
    pub relative_capacity: Option<u8>,
    #[serde(default)]
    pub max_ue: Option<usize>,
    #[serde(default)]
    pub max_enb: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SgwSectionConf {
    #[serde(default)]
    pub gtpc: Vec<ServerConf>,
}

/// Raw YAML document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmeConfigFile {
    pub mme: MmeSectionConf,
    #[serde(default)]
    pub sgw: SgwSectionConf,
}

// ============================================================================
// Validated configuration
// ============================================================================

/// Served GUMMEI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedGummei {
    /// PLMN IDs
    pub plmn_id: Vec<PlmnId>,
    /// MME group IDs
    pub mme_gid: Vec<u16>,
    /// MME codes
    pub mme_code: Vec<u8>,
}

/// Validated MME configuration
#[derive(Debug, Clone)]
pub struct MmeConfig {
    /// S1AP listen addresses
    pub s1ap: Vec<SocketAddr>,
    /// S11 local address
    pub gtpc: SocketAddr,
    /// Served GUMMEIs, at least one
    pub served_gummei: Vec<ServedGummei>,
    /// Served tracking areas
    pub served_tai: Vec<EpsTai>,
    pub mme_name: Option<String>,
    pub relative_capacity: u8,
    /// UE pool size
    pub max_ue: usize,
    /// eNB pool size
    pub max_enb: usize,
    /// Serving gateways, at least one
    pub sgw: Vec<SocketAddr>,
}

impl MmeConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let file: MmeConfigFile = serde_yaml::from_str(yaml)?;
        Self::try_from(file)
    }

    /// First PLMN ID and MME group ID of the first served GUMMEI.
    ///
    /// GUTIs received from UEs are completed with these.
    pub fn primary_plmn_gid(&self) -> Option<(&PlmnId, u16)> {
        let gummei = self.served_gummei.first()?;
        Some((gummei.plmn_id.first()?, *gummei.mme_gid.first()?))
    }
}

impl TryFrom<MmeConfigFile> for MmeConfig {
    type Error = ConfigError;

    fn try_from(file: MmeConfigFile) -> ConfigResult<Self> {
        let mme = file.mme;

        let s1ap = mme
            .s1ap
            .iter()
            .map(|s| parse_socket_addr(s, OGS_S1AP_SCTP_PORT))
            .collect::<ConfigResult<Vec<_>>>()?;

        let gtpc = match mme.gtpc.first() {
            Some(s) => parse_socket_addr(s, OGS_GTPV2_C_UDP_PORT)?,
            None => return Err(ConfigError::Validation("mme.gtpc is empty".into())),
        };

        let mut served_gummei = Vec::with_capacity(mme.gummei.len());
        for (i, g) in mme.gummei.iter().enumerate() {
            let plmn_id = g
                .plmn_id
                .to_vec()
                .iter()
                .map(parse_plmn_id)
                .collect::<ConfigResult<Vec<_>>>()?;
            let gummei = ServedGummei {
                plmn_id,
                mme_gid: g.mme_gid.to_vec(),
                mme_code: g.mme_code.to_vec(),
            };
            if gummei.plmn_id.is_empty() || gummei.mme_gid.is_empty() || gummei.mme_code.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "mme.gummei[{}] needs plmn_id, mme_gid and mme_code",
                    i
                )));
            }
            served_gummei.push(gummei);
        }
        if served_gummei.is_empty() {
            return Err(ConfigError::Validation("no mme.gummei configured".into()));
        }

        let mut served_tai = Vec::new();
        for t in &mme.tai {
            let plmn_id = parse_plmn_id(&t.plmn_id)?;
            for tac in t.tac.to_vec() {
                served_tai.push(EpsTai {
                    plmn_id: plmn_id.clone(),
                    tac,
                });
            }
        }

        let sgw = file
            .sgw
            .gtpc
            .iter()
            .map(|s| parse_socket_addr(s, OGS_GTPV2_C_UDP_PORT))
            .collect::<ConfigResult<Vec<_>>>()?;
        if sgw.is_empty() {
            return Err(ConfigError::Validation("no sgw.gtpc configured".into()));
        }

        let max_ue = mme.max_ue.unwrap_or(MAX_NUM_OF_UE);
        let max_enb = mme.max_enb.unwrap_or(MAX_NUM_OF_ENB);
        if max_ue == 0 || max_enb == 0 {
            return Err(ConfigError::Validation("max_ue and max_enb must be non-zero".into()));
        }

        Ok(Self {
            s1ap,
            gtpc,
            served_gummei,
            served_tai,
            mme_name: mme.mme_name,
            relative_capacity: mme.relative_capacity.unwrap_or(DEFAULT_RELATIVE_CAPACITY),
            max_ue,
            max_enb,
            sgw,
        })
    }
}

fn parse_socket_addr(conf: &ServerConf, default_port: u16) -> ConfigResult<SocketAddr> {
    let ip: IpAddr = conf
        .address
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(conf.address.clone()))?;
    Ok(SocketAddr::new(ip, conf.port.unwrap_or(default_port)))
}

fn parse_plmn_id(conf: &PlmnIdConf) -> ConfigResult<PlmnId> {
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if conf.mcc.len() != 3 || !all_digits(&conf.mcc) {
        return Err(ConfigError::Validation(format!("invalid MCC '{}'", conf.mcc)));
    }
    if !(2..=3).contains(&conf.mnc.len()) || !all_digits(&conf.mnc) {
        return Err(ConfigError::Validation(format!("invalid MNC '{}'", conf.mnc)));
    }
    Ok(PlmnId::new(&conf.mcc, &conf.mnc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mme:
  s1ap:
    - address: 127.0.0.2
  gtpc:
    - address: 127.0.0.2
  gummei:
    - plmn_id:
        mcc: "001"
        mnc: "01"
      mme_gid: 2
      mme_code: 1
  tai:
    - plmn_id:
        mcc: "001"
        mnc: "01"
      tac: [1, 2]
  mme_name: nextgcore-mme0
sgw:
  gtpc:
    - address: 127.0.0.3
"#;

    #[test]
    fn test_load_sample() {
        let config = MmeConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.s1ap, vec!["127.0.0.2:36412".parse().unwrap()]);
        assert_eq!(config.gtpc, "127.0.0.2:2123".parse().unwrap());
        assert_eq!(config.sgw, vec!["127.0.0.3:2123".parse().unwrap()]);
        assert_eq!(config.served_tai.len(), 2);
        assert_eq!(config.served_tai[1].tac, 2);
        assert_eq!(config.relative_capacity, DEFAULT_RELATIVE_CAPACITY);
        assert_eq!(config.max_ue, MAX_NUM_OF_UE);
        assert_eq!(config.mme_name.as_deref(), Some("nextgcore-mme0"));

        let (plmn_id, gid) = config.primary_plmn_gid().unwrap();
        assert_eq!(plmn_id, &PlmnId::new("001", "01"));
        assert_eq!(gid, 2);
    }

    #[test]
    fn test_gummei_lists() {
        let yaml = SAMPLE.replace("mme_gid: 2", "mme_gid: [4, 5]");
        let config = MmeConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.served_gummei[0].mme_gid, vec![4, 5]);
        assert_eq!(config.primary_plmn_gid().unwrap().1, 4);
    }

    #[test]
    fn test_missing_gummei_rejected() {
        let yaml = r#"
mme:
  gtpc:
    - address: 127.0.0.2
sgw:
  gtpc:
    - address: 127.0.0.3
"#;
        assert!(matches!(
            MmeConfig::from_yaml_str(yaml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_sgw_rejected() {
        let yaml = SAMPLE.replace("sgw:\n  gtpc:\n    - address: 127.0.0.3\n", "");
        assert!(matches!(
            MmeConfig::from_yaml_str(&yaml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_mcc_rejected() {
        let yaml = SAMPLE.replacen("mcc: \"001\"", "mcc: \"0a1\"", 1);
        assert!(matches!(
            MmeConfig::from_yaml_str(&yaml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_address_rejected() {
        let yaml = SAMPLE.replace("127.0.0.3", "not-an-ip");
        assert!(matches!(
            MmeConfig::from_yaml_str(&yaml),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_yaml_syntax_error() {
        assert!(matches!(
            MmeConfig::from_yaml_str("mme: [unclosed"),
            Err(ConfigError::Parse(_))
        ));
    }
}

//! Recording fakes and a harness for driving `MmeApp` in tests

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use ogs_core::OgsPkbuf;

use crate::app::MmeApp;
use crate::config::MmeConfig;
use crate::context::{EnbId, IpAddr, MmeUe, SessId};
use crate::event::{event_channel, MmeEvent, MmeEventReceiver};
use crate::gtp_path::{GtpPathResult, GtpSender};
use crate::nas_security::{NasError, NasResult, NasSecurityContext, NasSecurityEngine, SecurityHeaderType};
use crate::s1ap_build::{IeS1apBuilder, S1apBuild, S1apBuildResult};
use crate::s1ap_message::S1apCause;
use crate::s1ap_path::{S1apPath, S1apPathResult};

pub const ENB_ADDR: &str = "127.0.0.10:36412";

const TEST_CONFIG: &str = r#"
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
      tac: 1
  mme_name: nextgcore-mme0
  max_ue: 64
  max_enb: 8
sgw:
  gtpc:
    - address: 127.0.0.3
"#;

pub fn test_config() -> MmeConfig {
    MmeConfig::from_yaml_str(TEST_CONFIG).unwrap()
}

/// Everything sent toward eNBs, in order
#[derive(Debug, Clone, Default)]
pub struct RecordingS1apPath {
    pub sent: Rc<RefCell<Vec<(SocketAddr, Bytes)>>>,
}

impl S1apPath for RecordingS1apPath {
    fn send_to_enb(&mut self, enb_addr: SocketAddr, pkbuf: Bytes) -> S1apPathResult<()> {
        self.sent.borrow_mut().push((enb_addr, pkbuf));
        Ok(())
    }
}

/// Everything sent toward SGWs, in order
#[derive(Debug, Clone, Default)]
pub struct RecordingGtpSender {
    pub sent: Rc<RefCell<Vec<(SocketAddr, Bytes)>>>,
}

impl GtpSender for RecordingGtpSender {
    fn send(&mut self, peer: SocketAddr, buf: Bytes) -> GtpPathResult<()> {
        self.sent.borrow_mut().push((peer, buf));
        Ok(())
    }
}

/// Encodes with `IeS1apBuilder` and records what was asked for
#[derive(Debug, Clone, Default)]
pub struct CountingS1apBuild {
    pub paging_builds: Rc<Cell<usize>>,
    pub release_commands: Rc<RefCell<Vec<(Option<u32>, u32, S1apCause)>>>,
}

impl S1apBuild for CountingS1apBuild {
    fn build_setup_response(&self, config: &MmeConfig) -> S1apBuildResult<Bytes> {
        IeS1apBuilder.build_setup_response(config)
    }

    fn build_ue_context_release_command(
        &self,
        enb_ue_s1ap_id: Option<u32>,
        mme_ue_s1ap_id: u32,
        cause: S1apCause,
    ) -> S1apBuildResult<Bytes> {
        self.release_commands
            .borrow_mut()
            .push((enb_ue_s1ap_id, mme_ue_s1ap_id, cause));
        IeS1apBuilder.build_ue_context_release_command(enb_ue_s1ap_id, mme_ue_s1ap_id, cause)
    }

    fn build_paging(&self, mme_ue: &MmeUe) -> S1apBuildResult<Bytes> {
        self.paging_builds.set(self.paging_builds.get() + 1);
        IeS1apBuilder.build_paging(mme_ue)
    }
}

/// Rejects every message
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingNasSecurity;

impl NasSecurityEngine for FailingNasSecurity {
    fn decode(
        &self,
        _security: &mut NasSecurityContext,
        _security_header_type: SecurityHeaderType,
        _pkbuf: &mut OgsPkbuf,
    ) -> NasResult<()> {
        Err(NasError::SecurityDecode("MAC mismatch".into()))
    }
}

pub struct TestHarness {
    pub app: MmeApp,
    pub rx: MmeEventReceiver,
    pub s1ap: RecordingS1apPath,
    pub gtp: RecordingGtpSender,
    pub build: CountingS1apBuild,
}

impl TestHarness {
    pub fn new() -> Self {
        let (tx, rx) = event_channel();
        let s1ap = RecordingS1apPath::default();
        let gtp = RecordingGtpSender::default();
        let build = CountingS1apBuild::default();
        let app = MmeApp::new(
            Arc::new(test_config()),
            tx,
            Box::new(s1ap.clone()),
            Box::new(gtp.clone()),
        )
        .with_s1ap_build(Box::new(build.clone()));

        Self {
            app,
            rx,
            s1ap,
            gtp,
            build,
        }
    }

    /// Connect an eNB at `ENB_ADDR`
    pub fn add_enb(&mut self) -> EnbId {
        self.add_enb_at(ENB_ADDR)
    }

    pub fn add_enb_at(&mut self, addr: &str) -> EnbId {
        self.app.context.enb_add(addr.parse().unwrap()).unwrap()
    }

    /// Give the default bearer of `sess` an eNB S1-U endpoint, as an
    /// Initial Context Setup Response would
    pub fn set_enb_s1u(&mut self, sess: SessId) {
        let bearer = self.app.context.sess_mut(sess).unwrap().default_bearer_mut();
        bearer.enb_s1u_teid = 0x0a00_0001;
        bearer.enb_s1u_addr = Some(IpAddr {
            ipv4: Some([10, 0, 0, 1]),
            ipv6: None,
        });
    }

    /// Drain queued events
    pub fn events(&mut self) -> Vec<MmeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

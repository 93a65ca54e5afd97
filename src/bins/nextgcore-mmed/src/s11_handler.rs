//! S11 (GTP-C) Message Handling
//!
//! Responses from the SGW are matched to their local transaction by
//! sequence number; the transaction's action says what to do next.

use thiserror::Error;

use crate::app::MmeApp;
use crate::context::{EnbUeId, MmeUeId};
use crate::error::ErrorClass;
use crate::event::S11Response;
use crate::gtp_path::{GtpXactAction, GtpXactId};
use crate::s11_build::GtpCause;
use crate::s1ap_handler::{self, S1apError};

#[derive(Error, Debug)]
pub enum S11Error {
    #[error("no GTP transaction for sequence number {0}")]
    XactNotFound(u32),

    #[error("GTP transaction {0:?} already completed")]
    XactGone(GtpXactId),

    #[error("unexpected GTP message type {got} (expected {expected})")]
    UnexpectedMessage { expected: u8, got: u8 },

    #[error("{procedure} rejected by SGW (cause {cause:?})")]
    Rejected {
        procedure: &'static str,
        cause: Option<GtpCause>,
    },

    #[error("UE context released before {0}")]
    StaleContext(&'static str),

    #[error(transparent)]
    S1ap(#[from] S1apError),
}

pub type S11Result<T> = Result<T, S11Error>;

impl S11Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            S11Error::XactNotFound(_) | S11Error::XactGone(_) | S11Error::StaleContext(_) => {
                ErrorClass::NotFound
            }
            S11Error::UnexpectedMessage { .. } => ErrorClass::Malformed,
            S11Error::Rejected { .. } => ErrorClass::Fatal,
            S11Error::S1ap(e) => e.class(),
        }
    }
}

fn accepted(procedure: &'static str, cause: Option<GtpCause>) -> S11Result<()> {
    match cause {
        Some(c) if c.is_accepted() => Ok(()),
        cause => Err(S11Error::Rejected { procedure, cause }),
    }
}

/// Complete the transaction answered by `resp`
pub fn handle_s11_message(app: &mut MmeApp, resp: &S11Response) -> S11Result<()> {
    let id = app
        .xact_pool
        .find_by_sqn(resp.sequence_number)
        .ok_or(S11Error::XactNotFound(resp.sequence_number))?;
    let expected = app
        .xact_pool
        .get(id)
        .ok_or(S11Error::XactGone(id))?
        .header
        .message_type
        .wrapping_add(1);
    if resp.message_type != expected {
        return Err(S11Error::UnexpectedMessage {
            expected,
            got: resp.message_type,
        });
    }

    let xact = app.xact_pool.remove(id).ok_or(S11Error::XactGone(id))?;
    log::debug!(
        "[{}] Response type [{}] sqn [{}] TEID[0x{:x}]",
        id,
        resp.message_type,
        resp.sequence_number,
        resp.teid
    );

    match xact.action {
        GtpXactAction::ModifyBearer { sess, .. } => {
            accepted("Modify Bearer", resp.cause)?;
            if app.context.sess(sess).is_none() {
                return Err(S11Error::StaleContext("Modify Bearer Response"));
            }
            log::debug!("[{}] Modify Bearer Response", sess);
            Ok(())
        }
        GtpXactAction::ReleaseAccessBearers { enb_ue, mme_ue, sess } => {
            let ue = app
                .context
                .mme_ue_mut(mme_ue)
                .ok_or(S11Error::StaleContext("Release Access Bearers Response"))?;
            if let Err(e) = accepted("Release Access Bearers", resp.cause) {
                ue.release_access_bearers_failed = true;
                return Err(e);
            }
            log::debug!("[{}] Release Access Bearers Response", sess);

            release_access_bearers_done(app, enb_ue, mme_ue)
        }
    }
}

/// The last session answered releases the S1 side, unless any request of
/// the batch was refused or lost
fn release_access_bearers_done(app: &mut MmeApp, enb_ue: EnbUeId, mme_ue: MmeUeId) -> S11Result<()> {
    if app.xact_pool.release_access_bearers_pending(mme_ue) > 0 {
        return Ok(());
    }
    let failed = app
        .context
        .mme_ue(mme_ue)
        .map_or(true, |ue| ue.release_access_bearers_failed);
    if failed {
        log::error!("[{}] Access bearers not released, UE context kept", mme_ue);
        return Ok(());
    }
    if app.context.enb_ue(enb_ue).is_none() {
        return Err(S11Error::StaleContext("UE Context Release Command"));
    }
    s1ap_handler::handle_release_access_bearers_response(app, enb_ue)?;
    Ok(())
}

/// Drop a transaction the SGW never answered
pub fn handle_s11_timeout(app: &mut MmeApp, id: GtpXactId) -> S11Result<()> {
    let xact = app.xact_pool.remove(id).ok_or(S11Error::XactGone(id))?;
    log::error!(
        "[{}] No response from SGW [{}] type [{}] sqn [{}] after {} attempts",
        id,
        xact.peer,
        xact.header.message_type,
        xact.header.sequence_number,
        xact.attempts
    );

    if let GtpXactAction::ReleaseAccessBearers { mme_ue, .. } = xact.action {
        if let Some(ue) = app.context.mme_ue_mut(mme_ue) {
            ue.release_access_bearers_failed = true;
        }
    }
    Ok(())
}

use axum::extract::ws::Message;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::state::Member;

/// Outcome of one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Session ids whose queue was full or already closed.
    pub failed: Vec<String>,
}

/// Queue `frame` for every member. Never waits: a full or closed queue only
/// fails that member, the rest still get the frame. Membership is not
/// touched here; a dead session cleans itself up from its own receive loop.
pub fn fan_out(members: &[Member], frame: &str) -> Delivery {
    let mut out = Delivery::default();
    for m in members {
        match m.tx.try_send(Message::Text(frame.to_owned())) {
            Ok(()) => out.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(session = %m.id, "outbound queue full, frame dropped");
                out.failed.push(m.id.clone());
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %m.id, "outbound queue closed");
                out.failed.push(m.id.clone());
            }
        }
    }
    out
}

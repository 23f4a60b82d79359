//! Idle-session teardown
//!
//! A session that has carried no stream for the idle timeout closes itself.
//! The check is armed when the session is created and again every time the
//! stream table becomes empty. When it fires it re-validates under the
//! table lock, so a stream opened in the meantime keeps the session alive.

use std::sync::Weak;
use std::time::Duration;

use super::Session;

/// Terminal message recorded when the idle check closes a session
pub const IDLE_TIMEOUT_MSG: &str = "timeout";

/// Sleep for `after`, then close the session if it is still idle
pub(crate) async fn close_when_idle(session: Weak<Session>, after: Duration) {
    tokio::time::sleep(after).await;

    // A dropped session has nothing left to close
    let Some(session) = session.upgrade() else {
        return;
    };
    session.expire_if_idle();
}

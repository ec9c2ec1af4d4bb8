//! Hello → Identify → Identified handshake.
//!
//! [`Handshake`] is the per-connection state machine driven by the reader
//! task. It holds no I/O; it turns inbound `Hello`/`Identified` payloads into
//! the next outbound `Identify` or a terminal result, and reports that result
//! once through a oneshot to the task waiting in `connect()`.

use tokio::sync::oneshot;

use crate::auth::authentication_string;
use crate::error::ObsError;
use crate::protocol::{EventSubscription, Hello, Identified, Identify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingHello,
    AwaitingIdentified,
    Identified,
    Failed,
}

pub struct Handshake {
    password: Option<String>,
    subscriptions: EventSubscription,
    phase: Phase,
    result_tx: Option<oneshot::Sender<Result<u32, ObsError>>>,
}

impl Handshake {
    pub fn new(
        password: Option<String>,
        subscriptions: EventSubscription,
        result_tx: oneshot::Sender<Result<u32, ObsError>>,
    ) -> Self {
        Self {
            password,
            subscriptions,
            phase: Phase::AwaitingHello,
            result_tx: Some(result_tx),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn subscriptions(&self) -> EventSubscription {
        self.subscriptions
    }

    pub fn is_identified(&self) -> bool {
        self.phase == Phase::Identified
    }

    /// Whether the handshake has not reached a terminal phase yet.
    pub fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::AwaitingHello | Phase::AwaitingIdentified)
    }

    /// Handle `Hello`. Returns the `Identify` to send, `Ok(None)` if the
    /// message arrived out of order, or an error that ends the handshake.
    pub fn on_hello(&mut self, hello: &Hello) -> Result<Option<Identify>, ObsError> {
        if self.phase != Phase::AwaitingHello {
            return Ok(None);
        }

        let authentication = match (&hello.authentication, self.password.as_deref()) {
            (Some(auth), Some(password)) => Some(authentication_string(
                password,
                &auth.salt,
                &auth.challenge,
            )),
            (Some(_), None) => {
                self.fail(ObsError::AuthenticationRequired);
                return Err(ObsError::AuthenticationRequired);
            }
            (None, _) => None,
        };

        self.phase = Phase::AwaitingIdentified;
        Ok(Some(Identify {
            rpc_version: hello.rpc_version,
            authentication,
            event_subscriptions: self.subscriptions.bits(),
        }))
    }

    /// Handle `Identified`. Returns the negotiated RPC version if this
    /// completed the handshake, `None` if it arrived out of order.
    ///
    /// The waiting `connect()` is not woken here; call [`Handshake::complete`]
    /// once the session is ready to take requests.
    pub fn on_identified(&mut self, identified: &Identified) -> Option<u32> {
        if self.phase != Phase::AwaitingIdentified {
            return None;
        }
        self.phase = Phase::Identified;
        Some(identified.negotiated_rpc_version)
    }

    /// Report success to the waiting `connect()`. No-op unless identified.
    pub fn complete(&mut self, rpc_version: u32) {
        if self.phase != Phase::Identified {
            return;
        }
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(Ok(rpc_version));
        }
    }

    /// End a pending handshake with `error`. No-op once terminal.
    pub fn fail(&mut self, error: ObsError) {
        if !self.is_pending() {
            return;
        }
        self.phase = Phase::Failed;
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AuthChallenge;

    fn hello(auth: Option<AuthChallenge>) -> Hello {
        Hello {
            obs_studio_version: "30.2.0".into(),
            obs_web_socket_version: "5.5.0".into(),
            rpc_version: 1,
            authentication: auth,
        }
    }

    fn challenge() -> AuthChallenge {
        AuthChallenge {
            challenge: "c".into(),
            salt: "s".into(),
        }
    }

    #[test]
    fn identify_without_auth() {
        let (tx, _rx) = oneshot::channel();
        let mut hs = Handshake::new(None, EventSubscription::ALL, tx);
        let identify = hs.on_hello(&hello(None)).unwrap().unwrap();
        assert_eq!(identify.rpc_version, 1);
        assert_eq!(identify.event_subscriptions, 2047);
        assert!(identify.authentication.is_none());
        assert_eq!(hs.phase(), Phase::AwaitingIdentified);
    }

    #[test]
    fn identify_with_auth() {
        let (tx, _rx) = oneshot::channel();
        let mut hs = Handshake::new(Some("p".into()), EventSubscription::SCENES, tx);
        let identify = hs.on_hello(&hello(Some(challenge()))).unwrap().unwrap();
        assert_eq!(
            identify.authentication.as_deref(),
            Some("LEfh2WVBWpa8M06P7MehLXlToA1PtH2lNSNPjUZVYls=")
        );
        assert_eq!(identify.event_subscriptions, 1 << 2);
    }

    #[test]
    fn password_ignored_when_server_has_no_auth() {
        let (tx, _rx) = oneshot::channel();
        let mut hs = Handshake::new(Some("p".into()), EventSubscription::ALL, tx);
        let identify = hs.on_hello(&hello(None)).unwrap().unwrap();
        assert!(identify.authentication.is_none());
    }

    #[tokio::test]
    async fn challenge_without_password_fails() {
        let (tx, rx) = oneshot::channel();
        let mut hs = Handshake::new(None, EventSubscription::ALL, tx);
        assert!(matches!(
            hs.on_hello(&hello(Some(challenge()))),
            Err(ObsError::AuthenticationRequired)
        ));
        assert_eq!(hs.phase(), Phase::Failed);
        assert!(matches!(rx.await.unwrap(), Err(ObsError::AuthenticationRequired)));
    }

    #[tokio::test]
    async fn out_of_order_frames_are_ignored() {
        let (tx, rx) = oneshot::channel();
        let mut hs = Handshake::new(None, EventSubscription::ALL, tx);

        // Identified before Identify was sent
        assert_eq!(hs.on_identified(&Identified { negotiated_rpc_version: 1 }), None);
        assert!(hs.on_hello(&hello(None)).unwrap().is_some());
        // Duplicate Hello
        assert!(hs.on_hello(&hello(None)).unwrap().is_none());

        assert_eq!(hs.on_identified(&Identified { negotiated_rpc_version: 1 }), Some(1));
        assert!(hs.is_identified());
        // Late failure after identification changes nothing
        hs.fail(ObsError::ConnectionClosed);
        assert!(hs.is_identified());
        hs.complete(1);
        assert_eq!(rx.await.unwrap().unwrap(), 1);
    }

    #[test]
    fn identified_does_not_report_until_completed() {
        let (tx, mut rx) = oneshot::channel();
        let mut hs = Handshake::new(None, EventSubscription::ALL, tx);
        hs.on_hello(&hello(None)).unwrap();
        assert_eq!(hs.on_identified(&Identified { negotiated_rpc_version: 1 }), Some(1));
        assert!(rx.try_recv().is_err());

        hs.complete(1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
    }

    #[test]
    fn complete_before_identified_is_ignored() {
        let (tx, mut rx) = oneshot::channel();
        let mut hs = Handshake::new(None, EventSubscription::ALL, tx);
        hs.complete(1);
        assert!(rx.try_recv().is_err());
        assert!(hs.is_pending());
    }
}

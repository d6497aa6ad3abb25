use std::net::SocketAddr;

use crate::protocol::Kind;

/// Where a KDP session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No client has announced itself.
    Disconnected,
    /// A client sent `REATTACH`, and is expected to `CONNECT` next.
    AwaitingConnect,
    /// A client is connected.
    Connected,
}

/// Per-client bookkeeping.
#[derive(Debug)]
pub(crate) struct Session {
    state: SessionState,
    reply_addr: Option<SocketAddr>,
    exception_addr: Option<SocketAddr>,
    exception_seq: u8,
    finished: bool,
}

impl Session {
    pub fn new() -> Session {
        Session {
            state: SessionState::Disconnected,
            reply_addr: None,
            exception_addr: None,
            exception_seq: 0,
            finished: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Set once the client disconnected.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns `true` if a request of this kind may be served right now.
    pub fn allows(&self, kind: Kind) -> bool {
        match (self.state, kind) {
            (SessionState::Connected, Kind::Reattach) => false,
            (SessionState::Connected, Kind::Connect) => false,
            (SessionState::Connected, _) => true,
            (_, Kind::Reattach) => true,
            (SessionState::AwaitingConnect, Kind::Connect) => true,
            _ => false,
        }
    }

    /// Where replies are sent.
    pub fn reply_addr(&self) -> Option<SocketAddr> {
        self.reply_addr
    }

    /// Where `EXCEPTION` notifications are sent.
    pub fn exception_addr(&self) -> Option<SocketAddr> {
        self.exception_addr
    }

    pub fn reattach(&mut self, client: SocketAddr) {
        self.reply_addr = Some(client);
        self.state = SessionState::AwaitingConnect;
    }

    /// Exceptions go to the client host (as recorded by `REATTACH`), on the
    /// port announced by `CONNECT`.
    pub fn connect(&mut self, exc_note_port: u16) {
        self.exception_addr = self
            .reply_addr
            .map(|addr| SocketAddr::new(addr.ip(), exc_note_port));
        self.exception_seq = 0;
        self.state = SessionState::Connected;
    }

    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.finished = true;
    }

    /// Sequence number of the next `EXCEPTION` notification. Wraps at 256.
    pub fn next_exception_seq(&mut self) -> u8 {
        let seq = self.exception_seq;
        self.exception_seq = seq.wrapping_add(1);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        let client: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut session = Session::new();

        assert!(!session.allows(Kind::Connect));
        assert!(!session.allows(Kind::HostInfo));
        assert!(session.allows(Kind::Reattach));

        session.reattach(client);
        assert_eq!(session.state(), SessionState::AwaitingConnect);
        assert!(session.allows(Kind::Connect));
        assert!(session.allows(Kind::Reattach));
        assert!(!session.allows(Kind::ReadMem64));

        session.connect(5001);
        assert!(session.is_connected());
        assert_eq!(session.reply_addr(), Some(client));
        assert_eq!(
            session.exception_addr(),
            Some("127.0.0.1:5001".parse().unwrap())
        );
        assert!(session.allows(Kind::ReadMem64));
        assert!(!session.allows(Kind::Reattach));
        assert!(!session.allows(Kind::Connect));

        session.disconnect();
        assert!(session.is_finished());
        assert!(!session.allows(Kind::Disconnect));
    }

    #[test]
    fn exception_seq_wraps() {
        let mut session = Session::new();
        for i in 0..=255u8 {
            assert_eq!(session.next_exception_seq(), i);
        }
        assert_eq!(session.next_exception_seq(), 0);

        session.reattach("127.0.0.1:1".parse().unwrap());
        session.connect(2);
        assert_eq!(session.next_exception_seq(), 0);
    }
}

use std::fmt::{Display, Formatter, Result as FmtResult};

/// States of the protocol automaton.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum State {
    /// There is no connection. Start state of bound connections and the
    /// terminal state of every connection.
    Closed,

    /// The connection waits for a SYN in `accept`.
    Listen,

    /// A SYN has been sent and we're waiting for the SYN_ACK.
    SynSent,

    /// The SYN has been received and answered with a SYN_ACK, the final ACK
    /// is outstanding.
    ///
    /// This is the start state for connections spawned by `accept`.
    SynRcvd,

    /// The connection is open and data can be transferred.
    Established,

    /// We have sent a FIN and are waiting for it to be ACKed.
    FinWait1,

    /// Our FIN has been ACKed, now we wait for the peer's FIN.
    FinWait2,

    /// Both FINs have been ACKed. Late duplicates are absorbed until the
    /// quiescence interval has elapsed.
    TimeWait,

    /// The peer has sent a FIN, the application still has to `close`.
    CloseWait,

    /// We have answered the peer's FIN with our own and wait for its ACK.
    LastAck,
}

impl State {
    /// Checks whether the automaton may move from `self` to `next`.
    pub fn can_transition_to(self, next: State) -> bool {
        use self::State::*;

        match (self, next) {
            (Closed, SynSent)
            | (SynSent, Established)
            | (SynSent, Closed)
            | (Closed, Listen)
            | (Listen, SynRcvd)
            | (Listen, Closed)
            | (SynRcvd, Established)
            | (SynRcvd, FinWait1)
            | (Established, CloseWait)
            | (Established, FinWait1)
            | (Established, Closed)
            | (FinWait1, FinWait2)
            | (FinWait2, TimeWait)
            | (TimeWait, Closed)
            | (CloseWait, LastAck)
            | (LastAck, Closed) => true,
            _ => false,
        }
    }

    /// Whether application data may be exchanged in this state.
    pub fn is_established(self) -> bool {
        self == State::Established
    }
}

impl Default for State {
    fn default() -> Self {
        State::Closed
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynRcvd => "SYN_RCVD",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::TimeWait => "TIME_WAIT",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
        };

        name.fmt(fmt)
    }
}

#[cfg(test)]
mod tests {
    use super::State::*;
    use super::*;

    const ALL: [State; 10] = [
        Closed, Listen, SynSent, SynRcvd, Established,
        FinWait1, FinWait2, TimeWait, CloseWait, LastAck,
    ];

    #[test]
    fn active_close_path() {
        let path = [Established, FinWait1, FinWait2, TimeWait, Closed];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn passive_close_path() {
        let path = [Established, CloseWait, LastAck, Closed];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn handshake_paths() {
        assert!(Closed.can_transition_to(SynSent));
        assert!(SynSent.can_transition_to(Established));
        assert!(Closed.can_transition_to(Listen));
        assert!(Listen.can_transition_to(SynRcvd));
        assert!(SynRcvd.can_transition_to(Established));
    }

    #[test]
    fn no_self_loops() {
        for &state in ALL.iter() {
            assert!(!state.can_transition_to(state), "{} -> {}", state, state);
        }
    }

    #[test]
    fn closed_is_only_left_by_opening() {
        let targets: Vec<State> = ALL
            .iter()
            .cloned()
            .filter(|&s| Closed.can_transition_to(s))
            .collect();

        assert_eq!(targets, vec![Listen, SynSent]);
    }

    #[test]
    fn illegal_shortcuts() {
        assert!(!Established.can_transition_to(TimeWait));
        assert!(!FinWait1.can_transition_to(TimeWait));
        assert!(!CloseWait.can_transition_to(Closed));
        assert!(!Listen.can_transition_to(Established));
    }
}

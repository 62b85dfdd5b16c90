//! Termination handshake.
//!
//! ```text
//!                 terminate()                PipeTerm (delay)
//!   DelimiterReceived ──┐   Active ─────────────────────► WaitingForDelimiter
//!        ▲  │ PipeTerm  │     │ │ PipeTerm (no delay)          │ delimiter read,
//!  delim │  ▼           │     │ └───────────────┐              │ terminate(false)
//!   read │ TermAckSent ◄┼─────┼─────────────────┴──────────────┘
//!        │              ▼     ▼ terminate()
//!        └──────────  TermReqSent1 ──PipeTerm──► TermReqSent2
//!                           │ PipeTermAck (ack back)   │ PipeTermAck
//!                           ▼                          ▼
//!                       Terminated ◄───────────────────┘ ◄── TermAckSent + PipeTermAck
//! ```
//!
//! Each side sends at most one `PipeTerm` and exactly one `PipeTermAck`.

use log::trace;

use super::{Pipe, PipeEvents, PipeState, PipeStatus};
use crate::command::Command;
use crate::msg::Item;
use crate::{Error, Result};

impl Pipe {
    /// Starts or joins the termination handshake.
    ///
    /// With `delay` set, a pending peer request keeps draining inbound
    /// messages until the delimiter; otherwise they are treated as read.
    /// Calling it again once the handshake has started does nothing.
    pub fn terminate(&mut self, delay: bool) {
        self.delay = delay;

        match self.state {
            PipeState::TermReqSent1
            | PipeState::TermReqSent2
            | PipeState::TermAckSent
            | PipeState::Terminated => return,
            PipeState::Active | PipeState::DelimiterReceived => {
                self.send_to_peer(Command::PipeTerm);
                self.set_state(PipeState::TermReqSent1);
            }
            PipeState::WaitingForDelimiter if !self.delay => {
                self.rollback();
                self.out_pipe = None;
                self.send_to_peer(Command::PipeTermAck);
                self.set_state(PipeState::TermAckSent);
            }
            PipeState::WaitingForDelimiter => {}
        }

        self.out_active = false;

        if self.out_pipe.is_some() && !self.delimiter_written {
            self.rollback();
            if let Some(out) = self.out_pipe.as_mut() {
                out.write(Item::Delimiter, false);
            }
            self.delimiter_written = true;
            self.flush();
        }
    }

    pub(super) fn process_delimiter(&mut self) {
        match self.state {
            PipeState::Active => self.set_state(PipeState::DelimiterReceived),
            PipeState::WaitingForDelimiter => {
                self.rollback();
                self.out_pipe = None;
                self.send_to_peer(Command::PipeTermAck);
                self.set_state(PipeState::TermAckSent);
            }
            state => debug_assert!(false, "delimiter in {state:?}"),
        }
    }

    pub(super) fn process_pipe_term(&mut self) -> Result<()> {
        match self.state {
            PipeState::Active if self.delay => {
                self.set_state(PipeState::WaitingForDelimiter);
            }
            PipeState::Active | PipeState::DelimiterReceived => {
                self.out_pipe = None;
                self.send_to_peer(Command::PipeTermAck);
                self.set_state(PipeState::TermAckSent);
            }
            PipeState::TermReqSent1 => {
                self.out_pipe = None;
                self.send_to_peer(Command::PipeTermAck);
                self.set_state(PipeState::TermReqSent2);
            }
            state => {
                debug_assert!(false, "pipe term in {state:?}");
                return Err(Error::Protocol("unexpected pipe term"));
            }
        }
        Ok(())
    }

    pub(super) fn process_pipe_term_ack(
        &mut self,
        events: &mut dyn PipeEvents,
    ) -> Result<PipeStatus> {
        match self.state {
            PipeState::TermReqSent1 => {
                self.out_pipe = None;
                self.send_to_peer(Command::PipeTermAck);
            }
            PipeState::TermReqSent2 | PipeState::TermAckSent => {}
            state => {
                debug_assert!(false, "pipe term ack in {state:?}");
                return Err(Error::Protocol("unexpected pipe term ack"));
            }
        }

        events.pipe_terminated(self.id);

        // Nothing reads from here again; drop what the peer left behind.
        let mut dropped = 0usize;
        while self.in_pipe.read().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            trace!("{} dropped {dropped} unread items", self.id);
        }
        self.set_state(PipeState::Terminated);
        Ok(PipeStatus::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{pipepair, PairConfig};
    use super::*;
    use crate::command::{CommandSink, Envelope, LocalSink};
    use crate::msg::Msg;

    #[derive(Default)]
    struct Recorder {
        terminated: usize,
    }

    impl PipeEvents for Recorder {
        fn pipe_terminated(&mut self, _pipe: crate::command::PipeId) {
            self.terminated += 1;
        }
    }

    fn pair(delay: [bool; 2]) -> (Pipe, Pipe, Arc<LocalSink>, Arc<LocalSink>) {
        let a = Arc::new(LocalSink::new());
        let b = Arc::new(LocalSink::new());
        let (pa, pb) = pipepair(
            [
                Arc::clone(&a) as Arc<dyn CommandSink>,
                Arc::clone(&b) as Arc<dyn CommandSink>,
            ],
            PairConfig {
                delay,
                ..PairConfig::default()
            },
        );
        (pa, pb, a, b)
    }

    fn commands(envelopes: &[Envelope]) -> Vec<&'static str> {
        envelopes
            .iter()
            .map(|env| match env.command {
                Command::ActivateRead => "activate_read",
                Command::ActivateWrite { .. } => "activate_write",
                Command::Hiccup { .. } => "hiccup",
                Command::PipeTerm => "term",
                Command::PipeTermAck => "term_ack",
            })
            .collect()
    }

    #[test]
    fn local_terminate_without_delay_on_peer() {
        let (mut a, mut b, sa, sb) = pair([true, false]);
        let mut events_a = Recorder::default();
        let mut events_b = Recorder::default();

        // Put b's reader to sleep so a's final flush has to wake it.
        assert!(b.read().is_none());
        a.terminate(true);
        assert_eq!(a.state(), PipeState::TermReqSent1);
        a.terminate(true);

        let to_b = sb.drain();
        assert_eq!(commands(&to_b), vec!["term", "activate_read"]);
        for env in to_b {
            assert_eq!(
                b.process_command(env.command, &mut events_b).expect("b"),
                PipeStatus::Alive
            );
        }
        assert_eq!(b.state(), PipeState::TermAckSent);
        assert!(b.write(Msg::new("late")).is_err());
        assert!(b.read().is_none());

        let to_a = sa.drain();
        assert_eq!(commands(&to_a), vec!["term_ack"]);
        for env in to_a {
            assert_eq!(
                a.process_command(env.command, &mut events_a).expect("a"),
                PipeStatus::Terminated
            );
        }
        let to_b = sb.drain();
        assert_eq!(commands(&to_b), vec!["term_ack"]);
        for env in to_b {
            assert_eq!(
                b.process_command(env.command, &mut events_b).expect("b"),
                PipeStatus::Terminated
            );
        }
        assert_eq!(events_a.terminated, 1);
        assert_eq!(events_b.terminated, 1);
        assert!(a.is_terminated() && b.is_terminated());
        assert!(sa.is_empty());
    }

    #[test]
    fn delimiter_read_before_term_request() {
        let (mut a, mut b, _sa, sb) = pair([true, true]);
        a.write(Msg::new("last")).expect("write");
        a.terminate(true);

        // b keeps reading and hits the delimiter before the term command.
        assert_eq!(b.read().expect("last").data(), b"last");
        assert!(b.read().is_none());
        assert_eq!(b.state(), PipeState::DelimiterReceived);

        let envelopes = sb.drain();
        for env in envelopes {
            b.process_command(env.command, &mut ()).expect("b");
        }
        assert_eq!(b.state(), PipeState::TermAckSent);
    }

    #[test]
    fn waiting_for_delimiter_drains_then_acks() {
        let (mut a, mut b, sa, sb) = pair([true, true]);
        a.write(Msg::new("one")).expect("write");
        a.write(Msg::new("two")).expect("write");
        a.flush();
        a.terminate(true);

        for env in sb.drain() {
            b.process_command(env.command, &mut ()).expect("b");
        }
        assert_eq!(b.state(), PipeState::WaitingForDelimiter);
        assert_eq!(b.read().expect("one").data(), b"one");
        assert_eq!(b.read().expect("two").data(), b"two");
        assert!(b.read().is_none());
        assert_eq!(b.state(), PipeState::TermAckSent);
        assert_eq!(commands(&sa.drain()), vec!["term_ack"]);
    }

    #[test]
    fn unexpected_ack_is_a_protocol_error_in_release() {
        if cfg!(debug_assertions) {
            return;
        }
        let (mut a, _b, _sa, _sb) = pair([true, true]);
        let err = a
            .process_command(Command::PipeTermAck, &mut ())
            .expect_err("active pipe cannot take an ack");
        assert!(matches!(err, Error::Protocol(_)));
    }
}

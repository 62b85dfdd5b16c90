//! Bidirectional, watermark-controlled pipe between two endpoints.
//!
//! A pipe is a pair of halves created together by [`pipepair`]. Each half
//! owns the reader of one [`ypipe`](crate::ypipe) and the writer of the
//! other, and talks to its peer only through commands addressed by
//! [`PipeId`] and delivered through the peer's [`CommandSink`].
//!
//! ## Flow control
//!
//! The writer counts completed messages in `msgs_written`; the reader counts
//! them in `msgs_read` and reports the total back every `lwm` messages with
//! `ActivateWrite`. The writer refuses new messages while
//! `msgs_written - peers_msgs_read >= hwm`.
//!
//! ## Termination
//!
//! Either side may start the handshake; see [`PipeState`] and the `term`
//! module.

mod term;

use std::sync::Arc;

use log::trace;

use crate::command::{Command, CommandSink, Envelope, PipeId};
use crate::msg::{Item, Msg};
use crate::ypipe::{ypipe, YPipeReader, YPipeWriter};
use crate::{Error, Result};

/// Default per-side high watermark, in messages.
pub const DEFAULT_HWM: u64 = 1000;

/// Termination progress of one half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Active,
    /// The peer asked to terminate; still draining until the delimiter.
    WaitingForDelimiter,
    /// Read the delimiter before the peer's termination request arrived.
    DelimiterReceived,
    /// This side asked to terminate and awaits the ack.
    TermReqSent1,
    /// Both sides asked; ack already sent, awaiting the peer's ack.
    TermReqSent2,
    /// Ack sent in response to the peer's request; awaiting the final ack.
    TermAckSent,
    Terminated,
}

/// Whether the half is still usable after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    Alive,
    /// The handshake is complete; the owner should drop the half.
    Terminated,
}

/// Notifications for the owner of a pipe half, raised while processing
/// commands.
pub trait PipeEvents {
    /// Messages are readable again after `read` returned `None`.
    fn read_activated(&mut self, _pipe: PipeId) {}
    /// The peer caught up and writing is possible again.
    fn write_activated(&mut self, _pipe: PipeId) {}
    /// The outbound side was replaced; unread outbound data is gone.
    fn hiccuped(&mut self, _pipe: PipeId) {}
    /// Called once, right before the half reports `Terminated`.
    fn pipe_terminated(&mut self, _pipe: PipeId) {}
}

/// Owner that ignores every notification.
impl PipeEvents for () {}

/// Construction parameters for a pair of pipe halves.
///
/// Index 0 configures the first half returned by [`pipepair`], index 1 the
/// second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairConfig {
    /// Outbound high watermark per side. 0 means unlimited.
    pub hwm: [u64; 2],
    /// Per side: on a peer termination request, keep reading until the
    /// delimiter instead of acking at once.
    pub delay: [bool; 2],
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            hwm: [DEFAULT_HWM, DEFAULT_HWM],
            delay: [true, true],
        }
    }
}

impl PairConfig {
    pub fn unbounded() -> Self {
        Self {
            hwm: [0, 0],
            ..Self::default()
        }
    }

    pub fn with_hwm(hwm: u64) -> Self {
        Self {
            hwm: [hwm, hwm],
            ..Self::default()
        }
    }
}

/// Low watermark for an inbound high watermark: half of it, rounded up.
pub fn compute_lwm(in_hwm: u64) -> u64 {
    (in_hwm + 1) / 2
}

struct Peer {
    id: PipeId,
    sink: Arc<dyn CommandSink>,
}

/// One half of a bidirectional pipe.
pub struct Pipe {
    id: PipeId,
    peer: Peer,
    in_pipe: YPipeReader<Item>,
    out_pipe: Option<YPipeWriter<Item>>,
    in_active: bool,
    out_active: bool,
    hwm: u64,
    lwm: u64,
    msgs_read: u64,
    msgs_written: u64,
    peers_msgs_read: u64,
    state: PipeState,
    delay: bool,
    delimiter_written: bool,
    routing_id: Option<Vec<u8>>,
    credential: Vec<u8>,
}

/// Creates two connected halves.
///
/// `sinks[i]` delivers commands to the owner of half `i`.
pub fn pipepair(sinks: [Arc<dyn CommandSink>; 2], config: PairConfig) -> (Pipe, Pipe) {
    let [sink0, sink1] = sinks;
    let (w01, r01) = ypipe();
    let (w10, r10) = ypipe();
    let id0 = PipeId::next();
    let id1 = PipeId::next();

    let first = Pipe::new(
        id0,
        Peer { id: id1, sink: sink1 },
        r10,
        w01,
        config.hwm[1],
        config.hwm[0],
        config.delay[0],
    );
    let second = Pipe::new(
        id1,
        Peer { id: id0, sink: sink0 },
        r01,
        w10,
        config.hwm[0],
        config.hwm[1],
        config.delay[1],
    );
    trace!("pipepair {id0} <-> {id1}");
    (first, second)
}

impl Pipe {
    fn new(
        id: PipeId,
        peer: Peer,
        in_pipe: YPipeReader<Item>,
        out_pipe: YPipeWriter<Item>,
        in_hwm: u64,
        out_hwm: u64,
        delay: bool,
    ) -> Self {
        Self {
            id,
            peer,
            in_pipe,
            out_pipe: Some(out_pipe),
            in_active: true,
            out_active: true,
            hwm: out_hwm,
            lwm: compute_lwm(in_hwm),
            msgs_read: 0,
            msgs_written: 0,
            peers_msgs_read: 0,
            state: PipeState::Active,
            delay,
            delimiter_written: false,
            routing_id: None,
            credential: Vec::new(),
        }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn peer_id(&self) -> PipeId {
        self.peer.id
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == PipeState::Terminated
    }

    pub fn hwm(&self) -> u64 {
        self.hwm
    }

    pub fn lwm(&self) -> u64 {
        self.lwm
    }

    pub fn routing_id(&self) -> Option<&[u8]> {
        self.routing_id.as_deref()
    }

    pub fn set_routing_id(&mut self, routing_id: Vec<u8>) {
        self.routing_id = Some(routing_id);
    }

    /// Last credential received from the peer.
    pub fn credential(&self) -> &[u8] {
        &self.credential
    }

    pub fn set_hwms(&mut self, in_hwm: u64, out_hwm: u64) {
        self.lwm = compute_lwm(in_hwm);
        self.hwm = out_hwm;
    }

    /// Whether another complete message fits under the high watermark.
    pub fn check_hwm(&self) -> bool {
        self.hwm == 0 || self.msgs_written.saturating_sub(self.peers_msgs_read) < self.hwm
    }

    fn readable_state(&self) -> bool {
        matches!(
            self.state,
            PipeState::Active | PipeState::WaitingForDelimiter
        )
    }

    pub fn check_read(&mut self) -> bool {
        if !self.in_active || !self.readable_state() {
            return false;
        }
        if !self.in_pipe.check_read() {
            self.in_active = false;
            return false;
        }
        if self.in_pipe.probe(Item::is_delimiter) {
            let _ = self.in_pipe.read();
            self.process_delimiter();
            return false;
        }
        true
    }

    /// Reads the next message part.
    ///
    /// `None` means nothing is readable now; the owner hears about new data
    /// through [`PipeEvents::read_activated`].
    pub fn read(&mut self) -> Option<Msg> {
        if !self.in_active || !self.readable_state() {
            return None;
        }

        let msg = loop {
            match self.in_pipe.read() {
                None => {
                    self.in_active = false;
                    return None;
                }
                Some(Item::Credential(credential)) => self.credential = credential,
                Some(Item::Delimiter) => {
                    self.process_delimiter();
                    return None;
                }
                Some(Item::Message(msg)) => break msg,
            }
        };

        if msg.completes_message() {
            self.msgs_read += 1;
            if self.lwm > 0 && self.msgs_read % self.lwm == 0 {
                self.send_to_peer(Command::ActivateWrite {
                    msgs_read: self.msgs_read,
                });
            }
        }
        Some(msg)
    }

    pub fn check_write(&mut self) -> bool {
        if !self.out_active || self.state != PipeState::Active {
            return false;
        }
        if !self.check_hwm() {
            self.out_active = false;
            return false;
        }
        true
    }

    /// Queues a message part. Nothing is visible to the peer before
    /// [`Pipe::flush`].
    ///
    /// A refused part is handed back.
    pub fn write(&mut self, msg: Msg) -> std::result::Result<(), Msg> {
        if !self.check_write() {
            return Err(msg);
        }
        let Some(out) = self.out_pipe.as_mut() else {
            return Err(msg);
        };
        let more = msg.has_more();
        let counts = msg.completes_message();
        out.write(Item::Message(msg), more);
        if counts {
            self.msgs_written += 1;
        }
        Ok(())
    }

    /// Queues a credential for the peer. Not subject to the watermark.
    pub fn write_credential(&mut self, credential: Vec<u8>) -> bool {
        if self.state != PipeState::Active {
            return false;
        }
        match self.out_pipe.as_mut() {
            Some(out) => {
                out.write(Item::Credential(credential), false);
                true
            }
            None => false,
        }
    }

    /// Drops the unfinished trailing message, if any.
    pub fn rollback(&mut self) {
        if let Some(out) = self.out_pipe.as_mut() {
            while let Some(item) = out.unwrite() {
                debug_assert!(matches!(&item, Item::Message(msg) if msg.has_more()));
            }
        }
    }

    pub fn flush(&mut self) {
        if self.state == PipeState::TermAckSent {
            return;
        }
        let asleep = match self.out_pipe.as_mut() {
            Some(out) => !out.flush(),
            None => false,
        };
        if asleep {
            self.send_to_peer(Command::ActivateRead);
        }
    }

    /// Swaps the inbound pipe for a fresh one, discarding whatever is in
    /// flight. The peer resumes writing into the new pipe.
    pub fn hiccup(&mut self) {
        if self.state != PipeState::Active {
            return;
        }
        let (writer, reader) = ypipe();
        let stale = std::mem::replace(&mut self.in_pipe, reader);
        self.in_active = true;
        trace!("{} hiccup", self.id);
        self.send_to_peer(Command::Hiccup {
            pipe: writer,
            stale,
        });
    }

    /// Applies a command from the peer.
    pub fn process_command(
        &mut self,
        command: Command,
        events: &mut dyn PipeEvents,
    ) -> Result<PipeStatus> {
        if self.state == PipeState::Terminated {
            debug_assert!(false, "command {command:?} for terminated {}", self.id);
            return Err(Error::Protocol("command for terminated pipe"));
        }
        match command {
            Command::ActivateRead => self.process_activate_read(events),
            Command::ActivateWrite { msgs_read } => self.process_activate_write(msgs_read, events),
            Command::Hiccup { pipe, stale } => self.process_hiccup(pipe, stale, events)?,
            Command::PipeTerm => self.process_pipe_term()?,
            Command::PipeTermAck => return self.process_pipe_term_ack(events),
        }
        Ok(PipeStatus::Alive)
    }

    fn process_activate_read(&mut self, events: &mut dyn PipeEvents) {
        if !self.in_active && self.readable_state() {
            self.in_active = true;
            events.read_activated(self.id);
        }
    }

    fn process_activate_write(&mut self, msgs_read: u64, events: &mut dyn PipeEvents) {
        self.peers_msgs_read = msgs_read;
        if !self.out_active && self.state == PipeState::Active {
            self.out_active = true;
            events.write_activated(self.id);
        }
    }

    fn process_hiccup(
        &mut self,
        pipe: YPipeWriter<Item>,
        mut stale: YPipeReader<Item>,
        events: &mut dyn PipeEvents,
    ) -> Result<()> {
        let Some(mut old) = self.out_pipe.take() else {
            debug_assert!(false, "hiccup for {} without outbound pipe", self.id);
            return Err(Error::Protocol("hiccup without outbound pipe"));
        };
        old.flush();
        while let Some(item) = stale.read() {
            if let Item::Message(msg) = item {
                if msg.completes_message() {
                    self.msgs_written = self.msgs_written.saturating_sub(1);
                }
            }
        }
        drop(old);

        self.out_pipe = Some(pipe);
        self.out_active = true;
        if self.state == PipeState::Active {
            events.hiccuped(self.id);
        }
        Ok(())
    }

    fn send_to_peer(&self, command: Command) {
        self.peer.sink.send(Envelope {
            dest: self.peer.id,
            command,
        });
    }

    fn set_state(&mut self, state: PipeState) {
        trace!("{} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("peer", &self.peer.id)
            .field("state", &self.state)
            .field("hwm", &self.hwm)
            .field("lwm", &self.lwm)
            .field("msgs_written", &self.msgs_written)
            .field("msgs_read", &self.msgs_read)
            .field("peers_msgs_read", &self.peers_msgs_read)
            .finish_non_exhaustive()
    }
}

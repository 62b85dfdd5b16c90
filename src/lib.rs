//! In-process messaging core: lock-free pipes with flow control and a
//! race-free shutdown handshake, driven by single-threaded reactors.
//!
//! Layers, leaf to root:
//!
//! - [`yqueue`]: chunked single-reader/single-writer queue
//! - [`ypipe`]: lock-free one-way pipe over it
//! - [`pipe`]: bidirectional pipe with watermarks and termination
//! - [`mailbox`] / [`signaler`]: cross-thread command delivery and wakeups
//! - [`reactor`]: fd readiness and timers on one thread

pub mod clock;
pub mod command;
pub mod error;
pub mod mailbox;
pub mod msg;
pub mod pipe;
pub mod reactor;
pub mod signaler;
pub mod ypipe;
pub mod yqueue;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use command::{Command, CommandSink, Envelope, LocalSink, PipeId};
pub use error::{Error, Result};
pub use mailbox::Mailbox;
pub use msg::{Item, Msg};
pub use pipe::{pipepair, PairConfig, Pipe, PipeEvents, PipeState, PipeStatus};
pub use reactor::{
    Context, EventHandler, Handle, Interest, Reactor, ReactorConfig, ReactorThread, TimerId,
};
pub use signaler::Signaler;
pub use ypipe::{ypipe, ypipe_with_chunk, YPipeReader, YPipeWriter};
pub use yqueue::YQueue;

//! Single-thread readiness polling shared by every producer.
//!
//! Each registered producer gets a [`SignalPipe`]; its transport writes a
//! byte there whenever it queues an event. The [`Poller`] thread waits on all
//! pipes at once with `poll(2)` and drains whichever client became readable,
//! time-boxed so that one busy client cannot starve the others.

mod poller;
mod signal_pipe;
mod state;

pub use poller::Poller;
pub use signal_pipe::SignalPipe;

pub(crate) use state::ClientPollState;

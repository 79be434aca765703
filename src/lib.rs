//! Spindle: a single-threaded cooperative fiber runtime on Linux
//! `io_uring`.
//!
//! Application code is written as straight-line, blocking-looking
//! routines; each runs on a [fiber](crate::fiber) with its own stack and
//! yields whenever it waits for I/O, a timer or an explicit
//! [`yield_now`]. The OS thread itself only ever blocks in the ring's
//! wait-for-completion call, so thousands of fibers multiplex onto one
//! thread.
//!
//! The library contains the following pieces:
//!
//! - [Fibers: spawn, join, cancel, yield](fiber)
//! - [The operation catalogue: read/write, accept/connect, splice, chains](mod@io)
//! - [Socket wrappers](net)
//! - [Sleeps, deadlines, the shared-granularity timer](timer)
//! - [Clock utilities](clock)
//! - [Pinned byte buffers](buf)
//! - [Error handling](error)
//!
//! ```no_run
//! use spindle::{Buffer, RingListener};
//!
//! spindle::run(|| {
//!     let listener = RingListener::bind("127.0.0.1:4000")?;
//!     listener.accept_loop(|client| {
//!         spindle::spawn(move || {
//!             let _ = spindle::io::read_loop(&client, 8192, |chunk| {
//!                 spindle::io::write(&client, &Buffer::from(chunk)).map(|_| ())
//!             });
//!         });
//!         Ok(())
//!     })?;
//!     Ok::<_, spindle::Error>(())
//! })
//! .unwrap()
//! .unwrap();
//! ```
//!
//! Linux-only by design: the backend relies on ring-based asynchronous
//! submission. x86_64 and aarch64.

#![cfg(target_os = "linux")]

pub mod buf;
pub mod clock;
pub mod error;
pub mod fiber;
pub mod io;
pub mod net;
pub mod ring;
pub mod timer;

mod op;
mod runtime;
mod stack;

pub use buf::Buffer;
pub use error::{Error, Result, Token};
pub use fiber::{spawn, suspend, yield_now, Fiber, JoinHandle};
pub use io::{chain, ChainOp, Interest};
pub use net::{connect, RingListener, RingStream};
pub use ring::{inflight_ops, set_idle_hook, set_idle_period, waker, Waker};
pub use runtime::{run, Wake};
pub use timer::{sleep, timeout, timeout_or, timer_loop, Timer};

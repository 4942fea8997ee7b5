//! Core of an asynchronous networking runtime: a reactor that multiplexes file
//! descriptors, a cooperative timer wheel, a deferred-function queue, strand-serialized
//! socket sessions with read/write back-pressure and zero-copy tracking, and a scheduler
//! that owns the driver thread pool.
//!
//! ```no_run
//! use std::time::Duration;
//! use hive_rt::epoll::{Epoll, Events, Token, Ready, EpollOpt};
//! use hive_rt::net::tcp::TcpListener;
//!
//! const SERVER: Token = Token(0);
//!
//! let epoll = Epoll::new().unwrap();
//! let listener = TcpListener::bind("127.0.0.1:0").unwrap();
//! epoll.add(&listener, SERVER, Ready::readable(), EpollOpt::edge()).unwrap();
//!
//! let mut events = Events::with_capacity(1024);
//! epoll.wait(&mut events, Some(Duration::from_millis(0))).unwrap();
//! ```

#[macro_use]
extern crate log;

#[macro_use]
pub(crate) mod sys;

pub mod epoll;
pub mod net;

pub mod controller;
pub mod coroutine;
pub mod deferred;
pub mod endpoint;
pub mod error;
pub mod log_context;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod session;
pub mod strand;
pub mod timer;

pub mod plus;
pub mod queue;

mod driver;
mod waker;

pub use driver::{Driver, DriverEvent};
pub use epoll::{Epoll, EpollOpt, Event, Events, Ready, SelectorId, Source, Token};
pub use error::{Error, Result};
pub use timer::{Timer, TimerEvent, TimerEventMask, TimerWheel};
pub use waker::Waker;

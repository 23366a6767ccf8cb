//! # corrente
//!
//! Reactive stream operators with demand-driven backpressure.
//!
//! A graph of operator nodes transports discrete signals (values, errors,
//! completion) from producers to consumers. Demand flows in the opposite
//! direction: a subscriber authorizes `Next` signals with `request(n)`, and
//! no conformant node ever emits past its credit.
//!
//! ```text
//!  ┌────────┐    ┌─────┐    ┌────────┐    ┌──────────────┐    ┌─────────┐
//!  │ source │ ─► │ map │ ─► │ filter │ ─► │ dispatch_on  │ ─► │ consume │
//!  └────────┘    └─────┘    └────────┘    └──────────────┘    └─────────┘
//!      ▲            signals (next / error / complete) ──►
//!      └────────────── demand (request / cancel) ◄──
//! ```
//!
//! ## Layers
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Timer | [`timer`] | monotonic deadlines for the timed operators |
//! | Dispatchers | [`dispatch`] | execution contexts (inline, FIFO thread, pool, lock-free ring) |
//! | Protocol | [`signal`], [`demand`], [`error`] | the four-signal contract and its accounting |
//! | Operators | [`op`], [`source`], [`broadcast`] | graph vertices implementing the contract |
//! | Façade | [`flow`], [`env`] | fluent builder and the dispatcher registry |
//!
//! ## Example
//!
//! ```
//! use corrente::Flow;
//!
//! let (broadcaster, flow) = Flow::<i64>::broadcast();
//! let total = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0));
//! let sink = total.clone();
//! flow.map(|n| n * 2)
//!     .filter(|n| n % 4 == 0)
//!     .consume(move |n| {
//!         sink.fetch_add(n, std::sync::atomic::Ordering::SeqCst);
//!     });
//!
//! for n in 1..=4 {
//!     broadcaster.broadcast_next(n);
//! }
//! broadcaster.broadcast_complete();
//! assert_eq!(total.load(std::sync::atomic::Ordering::SeqCst), 12);
//! ```

pub mod broadcast;
pub mod demand;
pub mod dispatch;
pub mod env;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod op;
pub mod signal;
pub mod source;
pub mod timer;

pub use broadcast::Broadcaster;
pub use demand::{Demand, UNBOUNDED};
pub use dispatch::{
    CallerDispatcher, Dispatcher, OverflowPolicy, PoolDispatcher, ProducerMode,
    RingDispatcher, ThreadDispatcher, WaitStrategy,
};
pub use env::{DispatcherConfig, DispatcherKind, Environment};
pub use envelope::{Envelope, Headers, ORIGIN_HEADER};
pub use error::{ErrorKind, FlowError};
pub use flow::{Collector, Flow};
pub use signal::{Lifecycle, Publisher, Signal, Subscriber, Subscription, Upstream};
pub use timer::{TimerRegistration, TimerService};

//! Bus I/O worker
//!
//! Keeps a set of interfaces alive according to configuration messages,
//! forwards every captured frame as a sequenced record and fans spoof
//! requests out to the interfaces.
//!
//! # Architecture
//!
//! ```text
//!   io_config ──► Worker ──(blocking pool)──► busio_iface::construct
//!                   │  Initializing ─► Operational ─► Captor::attach
//!                   │               └► Failed       Spoofer::attach
//!                   ▼
//!   io_status ◄── report()                 Iface ──► Captor ──► capture
//!   spoof ──────► Spoofer ──queue per iface──► Iface::spoof
//! ```
//!
//! The worker loop is a single task. Blocking work (construction, close)
//! runs on [`BlockingPool`] and comes back as completions. Each operational
//! interface has one spoof delivery task.

pub mod captor;
pub mod config;
pub mod error;
pub mod pool;
pub mod spoofer;
pub mod worker;

pub use captor::Captor;
pub use config::{PortNames, WorkerConfig};
pub use error::{JobError, WorkerError};
pub use pool::{BlockingPool, CancelFlag};
pub use spoofer::{SpoofStatus, Spoofer};
pub use worker::{Constructor, Worker};

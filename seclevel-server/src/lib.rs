//! # seclevel-server
//!
//! Per-device security-level negotiation service.
//!
//! [`SecurityLevelService`] tracks every peer it hears about, runs one
//! negotiation state machine per device, exchanges challenge-bound
//! credential messages over a [`Transport`], and fans the outcome out to
//! local callers waiting on that device.

pub mod config;
pub mod dump;
pub mod memory;
pub mod negotiation;
pub mod notify;
pub mod registry;
pub mod service;
pub mod tcp;
pub mod timer;
pub mod transport;

pub use config::{NodeConfig, ServiceConfig};
pub use dump::{render_text, DeviceSnapshot};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use negotiation::{DeviceNegotiation, NegotiationEvent};
pub use notify::{CallerId, LevelCallback, LevelResult};
pub use registry::DeviceRegistry;
pub use service::{SecurityLevelService, ServiceBuilder, WeakService};
pub use tcp::TcpTransport;
pub use timer::{TimerCallback, TimerHandle, TimerService, TokioTimer};
pub use transport::{Clock, SendFailure, SystemClock, Transport};

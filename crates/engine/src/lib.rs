//! Forwarding engine of relay-bridge: local forwards carry connections accepted on a local
//! listener to a relay endpoint, remote forwards deliver sessions accepted on a relay endpoint to
//! a local target. [`BridgeRegistry`] owns the running bridges and reconciles them with new rules.

mod bridge;
mod config;
mod error;
mod local_endpoint;
pub mod metrics;
mod pump;
mod registry;
mod resolver;
mod rule;
mod session;
mod transport;
mod utils;


pub use bridge::{Bridge, BridgeEvent, BridgeId, BridgeSnapshot, BridgeStats, BridgeStatus};
pub use config::EngineConfig;
pub use error::{classify_io_error, BindError, ConfigError, EngineError, PumpError, PumpSide, Severity, TransportError};
pub use local_endpoint::{LocalBinding, LocalListener, LocalStream, LocalTarget};
pub use pump::{pump, PumpOutcome, DEFAULT_BUFFER_SIZE};
pub use registry::{BridgeRegistry, ReconcileReport, RuleFailure};
pub use resolver::{local_addresses, resolve_bind_address, select_bind_address};
pub use rule::{Credentials, Direction, EndpointKey, ForwardRule, LocalForward, RelayConnection, RelayEndpoint, RemoteForward};
pub use session::{run_session, SessionConfig, SessionId, SessionOutcome};
pub use transport::{
    memory::{MemoryListener, MemoryRelay},
    RelayListener, RelayListenerEvent, RelayStream, RelayTransport,
};
pub use utils::ErrorExt;

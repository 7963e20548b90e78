//! ob daemon runtime: timers + scheduler + control socket.

mod error;
pub mod log_rotation;
pub mod logging;
pub mod paths;
pub mod pidfile;
pub mod protocol;
mod runtime;
pub mod scheduler;
pub mod systemd;

pub use error::DaemonError;
pub use logging::init_tracing;
pub use protocol::{
    request_squash, request_status, request_stop, request_sync, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, serve, start_blocking, LastCycle, Timers};
pub use scheduler::{FlightGuard, FlightRegistry, Scheduler, Trigger, TriggerOutcome};
pub use systemd::{install as install_service, uninstall as uninstall_service, UnitSpec};

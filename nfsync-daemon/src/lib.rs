//! Background daemon: interval scheduler, Unix socket trigger/status
//! server and log rotation around one shared engine.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request, request_reset, request_run, request_status, request_stop, request_stop_schedule,
    send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{
    handle_command, init_tracing, run, serve, start_blocking, DaemonContext, LOG_FORMAT_ENV,
    SCHEDULE_STOPPED_MESSAGE,
};

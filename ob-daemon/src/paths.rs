//! Filesystem layout of a running daemon. Everything lives next to the
//! config file under `<home>/.config/ob/`, except the systemd user unit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ob_core::config::config_dir_at;

pub const SERVICE_NAME: &str = "ob.service";

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const DAEMON_SOCKET: &str = "ob.sock";
pub const DAEMON_PID: &str = "ob.pid";

pub const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

pub fn socket_path(home: &Path) -> PathBuf {
    config_dir_at(home).join(DAEMON_SOCKET)
}

pub fn pid_path(home: &Path) -> PathBuf {
    config_dir_at(home).join(DAEMON_PID)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    config_dir_at(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}

pub fn systemd_user_dir(home: &Path) -> PathBuf {
    home.join(".config").join("systemd").join("user")
}

pub fn systemd_unit_path(home: &Path) -> PathBuf {
    systemd_user_dir(home).join(SERVICE_NAME)
}

use std::path::PathBuf;

/// Default path of the Unix socket the daemon listens on.
pub const SOCKET_PATH: &str = "/var/run/kubecia.sock";

/// Request header selecting the raw token JSON instead of the
/// ExecCredential envelope.
pub const DECAPSULED_HEADER: &str = "x-kubecia-decapsuled";

pub const USER_AGENT: &str = concat!("kubecia/", env!("CARGO_PKG_VERSION"));

/// Root directory of the on-disk token cache.
pub fn data_dir() -> PathBuf {
    home::home_dir()
        .map(|home| home.join(".kubecia"))
        .unwrap_or_else(|| PathBuf::from("/var/run/kubecia"))
}

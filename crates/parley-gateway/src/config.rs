use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the realtime core. The server crate fills this from the
/// environment; tests use `Default` and override what they need.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    /// Finalized files land here and are served under `/uploads`.
    pub upload_dir: PathBuf,
    /// Per-chunk staging area.
    pub upload_temp_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub upload_timeout: Duration,
    pub typing_ttl: Duration,
    /// Bounded outbound queue per connection; overflowing it drops the connection.
    pub outbound_queue: usize,
    /// Messages kept hot per room.
    pub message_cache: usize,
    /// Non-JSON frames tolerated before the connection is closed.
    pub malformed_tolerance: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "parley-dev-secret-change-me".to_string(),
            token_ttl: Duration::from_secs(720 * 3600),
            upload_dir: PathBuf::from("./uploads"),
            upload_temp_dir: PathBuf::from("./uploads/.partial"),
            max_upload_bytes: 100 * 1024 * 1024,
            upload_timeout: Duration::from_secs(600),
            typing_ttl: Duration::from_secs(6),
            outbound_queue: 256,
            message_cache: 500,
            malformed_tolerance: 1,
        }
    }
}

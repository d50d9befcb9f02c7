//! Shared constants used across the application.

/// User agent string sent with every archive API request.
pub const ARCHIVER_USER_AGENT: &str = concat!(
    "serp-wayback-archiver/",
    env!("CARGO_PKG_VERSION"),
    " (+https://web.archive.org/save)"
);

/// Save Page Now endpoint. The status API lives under `{endpoint}status/`.
pub const DEFAULT_WAYBACK_ENDPOINT: &str = "https://web.archive.org/save/";

/// Host used when composing the public snapshot URL.
pub const WAYBACK_WEB_BASE: &str = "http://web.archive.org/web";

/// Timestamp layout the archive service uses for snapshots (always UTC).
pub const WAYBACK_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Status codes worth retrying after a fixed pause.
pub const TRANSIENT_STATUS_CODES: &[u16] = &[502, 503, 504];

/// Status codes that never heal on their own. 104 and 443 are not real HTTP
/// statuses but the service has been seen to report them.
pub const HARD_STATUS_CODES: &[u16] = &[104, 401, 443];

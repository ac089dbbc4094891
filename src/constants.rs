// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const WS_PATH: &str = "ws";

// Collectibles
pub const DEFAULT_CLAIM_WINDOW_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DROP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_DROP_MIN_PARTICIPANTS: u32 = 3;
pub const DEFAULT_DROP_CHANCE: f64 = 0.5;

// Failure rate limiting
pub const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_RATE_LIMIT_BLOCK_SECS: u64 = 900;
pub const DEFAULT_RATE_LIMIT_CLEANUP_SECS: u64 = 300;

// Deadlines for a single transport send / store call
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 3_000;

// Proximity
pub const DEFAULT_NEARBY_RADIUS_KM: f64 = 5.0;
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

// Inbound frames larger than this are dropped without decoding
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 8 * 1024;
pub const MAX_CHAT_MESSAGE_LENGTH: usize = 2000;

// Close codes used when the registry closes a transport
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_REPLACED: u16 = 4000;
pub const CLOSE_SEND_FAILED: u16 = 4001;
pub const CLOSE_SESSION_IN_USE: u16 = 4002;

/// Application name used in e-mail subjects and headers
pub const APP_NAME: &str = "Convo";

/// Maximum participants of a thread, owner included
pub const THREAD_USER_LIMIT: usize = 11;

/// Maximum participants of an event, owner included
pub const EVENT_USER_LIMIT: usize = 300;

/// Maximum entries in a user's contact list
pub const CONTACT_LIMIT: usize = 50;

/// Maximum thread subject length in characters
pub const SUBJECT_MAX_LEN: usize = 255;

/// Length of user tokens, realtime tokens and event invite tokens
pub const TOKEN_LENGTH: usize = 32;

/// Freshness window for time-bound magic links (24 hours)
pub const MAGIC_LINK_TTL_SECS: i64 = 24 * 60 * 60;

/// bcrypt work factor for password digests
pub const BCRYPT_COST: u32 = 10;

/// How many recent child messages a mark-read walks
pub const READ_WALK_LIMIT: usize = 50;

/// Messages rendered into a thread e-mail
pub const THREAD_MAIL_MESSAGES: usize = 5;

/// Upcoming-event window of the digest, in hours from now
pub const DIGEST_UPCOMING_FROM_HOURS: i64 = 6;
pub const DIGEST_UPCOMING_TO_HOURS: i64 = 30;

/// Longest slug used in a reply address
pub const SLUG_MAX_LEN: usize = 20;

/// Default duration of an event in the generated calendar entry
pub const EVENT_DURATION_SECS: i64 = 60 * 60;

/// Queue name the e-mail worker expects on `/tasks/emails`
pub const EMAIL_QUEUE_NAME: &str = "convo-emails";

/// Transactions retried on commit conflict before giving up
pub const TRANSACTION_ATTEMPTS: usize = 3;

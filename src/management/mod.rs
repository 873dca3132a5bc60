mod session;

pub use session::CANONICAL_SYNC_CODE_KEY;
pub use session::LEGACY_SYNC_CODE_KEY;
pub use session::Session;
pub use session::SessionStore;
pub use session::migrate;

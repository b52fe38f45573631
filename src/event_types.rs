//! Well-known routing keys used by the surrounding services.
//!
//! The hub itself is stringly keyed; these constants only keep producers and
//! consumers of the standard deployment from drifting apart on spelling.

pub const AUTH_LOGIN: &str = "auth:login";
pub const AUTH_LOGOUT: &str = "auth:logout";
pub const AUTH_SESSION_EXPIRED: &str = "auth:session-expired";

pub const PAYMENTS_CREATED: &str = "payments:created";
pub const PAYMENTS_COMPLETED: &str = "payments:completed";
pub const PAYMENTS_FAILED: &str = "payments:failed";

pub const ADMIN_USER_UPDATED: &str = "admin:user-updated";
pub const ADMIN_ROLE_CHANGED: &str = "admin:role-changed";

pub const SYSTEM_HEALTH: &str = "system:health";

mod auth_code;
mod device;
mod handoff_code;
mod identity;
mod session;
mod sso_domain;
mod user;

pub use self::auth_code::{AuthCode, AuthCodeId};
pub use self::device::{Device, DeviceId, DeviceType};
pub use self::handoff_code::HandoffCode;
pub use self::identity::Identity;
pub use self::session::{RevokeReason, Session, SessionId};
pub use self::sso_domain::{AuthConnection, ConnectionId, SsoDomain};
pub use self::user::{User, UserId};

//! Login sessions: the identity a session carries, the clock it runs on and the
//! durable store that issues, validates, refreshes and revokes it.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod clock;
mod error;
mod session;
mod store;

pub use principal::AuthUser;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SessionError;
pub use session::{generate_token, is_well_formed, Session, SessionToken, TOKEN_LEN};
pub use store::{SessionSettings, SessionStore};

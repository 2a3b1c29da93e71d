//! HTTP binding of login sessions: the cookie codec and the request middleware.

mod cookie;
mod middleware;

pub use cookie::SessionCookies;
pub use middleware::{authenticate_request, redirect, CurrentUser, PublicPaths, SessionAuth};

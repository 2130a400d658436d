// mcp-gateway - session and gateway layer for ephemeral MCP web dashboards
//
// A hosting application creates short-lived, per-user web sessions backed by
// dynamically allocated TCP ports. In direct mode clients connect straight
// to the allocated port with an opaque token; in gateway mode all traffic
// enters through one fixed-port reverse proxy that resolves signed tokens to
// backend addresses via a shared Redis store.
//
// Architecture:
// - session: port allocator, token codec, store (memory/Redis), manager
// - gateway: axum front door - admin surface plus the token-routed proxy
// - config: defaults < file < environment < CLI flags
//
// The library surface exists so a hosting application can drive the
// SessionManager directly without going through the HTTP admin routes.

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod session;

pub use config::{Config, Mode};
pub use error::SessionError;
pub use session::{BackendAddr, Session, SessionManager, SessionStats};

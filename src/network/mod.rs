//! Network Layer
//!
//! WebSocket server for wager operations. This layer is transport glue -
//! all lifecycle decisions happen in `wager/`.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{validate_token, AuthConfig, AuthError, TokenClaims};
pub use protocol::{
    ClientMessage, ErrorCode, ServerError, ServerMessage, VerificationResult, WagerView,
};
pub use server::{ServerConfig, WagerServer, WagerServerError};

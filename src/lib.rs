//! Terminal client for the Locality Connect community-feedback service.
//!
//! Residents register against a locality, post suggestions and complaints,
//! vote on their neighbours' posts, and chat about the ones that reach the
//! discussion threshold. The server owns all of the scoring; this crate is
//! the client side: a typed REST client, a login session, and the live
//! chat session bound to a realtime message log.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`api`] | REST client and wire types; implements [`chat::ChatBackend`] |
//! | [`auth`] | Bearer-token session with optional file persistence |
//! | [`chat`] | [`chat::ChatSession`] lifecycle and message ordering |
//! | [`realtime`] | Snapshot-delivering log: Firebase streaming and in-memory |
//! | [`suggestions`] | Quota, draft validation, single-flight voting |
//! | [`config`] | Environment-driven client configuration |
//! | [`error`] | [`error::ErrorCode`] shared by every error enum |

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod realtime;
pub mod suggestions;

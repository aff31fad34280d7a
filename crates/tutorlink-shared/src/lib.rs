//! # tutorlink-shared
//!
//! Types, constants and the error taxonomy shared by every tutorlink crate.

pub mod constants;
pub mod error;
pub mod types;

pub use error::MessagingError;
pub use types::{ConversationKey, Identifier, RequestStatus};

//! # tutorlink-core
//!
//! Messaging core of Tutorlink, independent of any UI:
//!
//! - [`resolve_key`]: order-independent conversation keys.
//! - [`Messenger::subscribe_feed`]: live, ordered message list of one
//!   conversation, driving a [`NotificationTrigger`].
//! - [`Messenger::track_unread`]: per-counterparty unread counts.
//! - sending, mark-read, bulk clear and supervision requests.
//!
//! Every subscription is a [`futures::Stream`] paired with an
//! [`Unsubscribe`] handle.

pub mod feed;
pub mod handle;
pub mod messenger;
pub mod models;
pub mod notify;
pub mod requests;
pub mod resolver;
pub mod session;
#[cfg(feature = "audio-cue")]
pub mod tone;
pub mod unread;

pub use feed::{FeedSnapshot, MessageFeed};
pub use handle::Unsubscribe;
pub use messenger::{Messenger, MessagingOptions};
pub use models::{Message, SupervisionRequest};
pub use notify::{CommandCue, CueError, LogCue, NotificationCue, NotificationTrigger, TriggerState};
pub use requests::{Decision, RequestFeed, RequestSnapshot};
pub use resolver::resolve_key;
pub use session::{wait_for_user, AuthProvider, SessionAuth};
#[cfg(feature = "audio-cue")]
pub use tone::ToneCue;
pub use unread::{UnreadCounts, UnreadTracker};

pub use tutorlink_shared::{ConversationKey, Identifier, MessagingError, RequestStatus};

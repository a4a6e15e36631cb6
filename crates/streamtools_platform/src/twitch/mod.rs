#![forbid(unsafe_code)]

pub mod helix;
pub mod irc;
pub mod pubsub;
mod transport;

pub use helix::{HelixChatter, HelixClient, HelixUser, RefreshOutcome, TokenRefreshResponse, refresh_partner_token};
pub use pubsub::{PubSubClient, PubSubConfig, PubSubEvent, PubSubTopic};
pub use transport::{TwitchChatConfig, TwitchIrcTransport, TwitchTransportFactory};

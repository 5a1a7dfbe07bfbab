//! `chiroptera-middleware` – in-process event routing.
//!
//! Carries ranging, pose and scan events between the session's processing
//! task and whoever is listening (the CLI, loggers, tests) without either
//! side knowing about the other.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};

pub mod constraints;
pub mod contingent;
pub mod directive;
pub mod echo;
pub mod error;
pub mod events;
pub mod handlers;
pub mod moderation;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod user;
pub mod validation;

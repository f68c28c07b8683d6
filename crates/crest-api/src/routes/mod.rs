//! Route modules, one per concern.

pub mod auth;
pub mod channels;
pub mod devices;
pub mod health;
pub mod invites;
pub mod keys;
pub mod media;
pub mod messages;
pub mod roles;
pub mod users;

//! Repository modules — one per entity family.
//!
//! Every function takes `&SqlitePool` and performs plain queries. The
//! convention that keeps the store consistent: *mutating* functions are only
//! ever called from inside a closure submitted to the
//! [`crate::serializer::WriteSerializer`]; read functions may be called from
//! anywhere.

pub mod channels;
pub mod devices;
pub mod envelopes;
pub mod invites;
pub mod otp;
pub mod prekeys;
pub mod refresh_tokens;
pub mod roles;
pub mod sessions;
pub mod users;

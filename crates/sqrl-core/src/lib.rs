//! Stateless server-side building blocks for the SQRL (Secure, Quick,
//! Reliable Login) authentication protocol: nut generation and validation,
//! login URL construction, and the bounded request state machine that
//! drives one authentication exchange from a decoded client POST through
//! to a signed response.
//!
//! Nothing in this crate touches a network socket, a database, or a
//! clock's wall-clock dependents beyond [`nut::Nut::validate`]'s default
//! (see [`nut::Nut::validate_at`] for a deterministic variant). A host
//! application owns the HTTP layer, persistence, and the answers it
//! supplies to [`request::Request::handle`].

pub mod client;
pub mod codec;
pub mod error;
pub mod mac;
pub mod nut;
pub mod query;
pub mod request;
pub mod response;
pub mod server_data;
pub mod url;

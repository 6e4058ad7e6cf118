pub mod client;

pub use client::{AuthUser, ClientIdentity};

//! Read-only HTTP ops surface.

mod routes;

pub use routes::{router, serve};

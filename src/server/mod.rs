pub mod api;
pub mod auth;
pub mod http;
pub mod sse;

pub use http::{AppState, HttpServer};

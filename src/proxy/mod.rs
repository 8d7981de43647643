pub mod auth;
pub mod handlers;
pub mod sse;
pub mod upstream;

pub mod auth;
pub mod errors;
pub mod media;
pub mod response;
pub mod routes;
pub mod state;
pub mod tokens;
pub mod user;

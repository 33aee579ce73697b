pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod notifier;
pub mod pagination;
pub mod routes;
pub mod schema;
pub mod state;

pub use dispatch::{Actor, DispatchError, DispatchResult};
pub use routes::create_router;

pub mod app;
pub mod errors;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod templates;

pub use app::{build_router, serve};
pub use state::AppState;

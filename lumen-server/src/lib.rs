pub mod routes;

pub use routes::{create_app, AppState};

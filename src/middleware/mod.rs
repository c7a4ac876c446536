pub mod auth;
pub mod error_handling;
pub mod metrics;
pub mod request_id;

pub use auth::*;
pub use error_handling::*;
pub use metrics::*;
pub use request_id::*;

pub mod auth_service;
pub mod billing_service;
pub mod dispatch;
pub mod pipeline;
pub mod quota_service;
pub mod quota_worker;
pub mod router_service;
pub mod tool_mediator;

pub use auth_service::*;
pub use billing_service::*;
pub use pipeline::*;
pub use quota_service::*;
pub use quota_worker::*;
pub use router_service::*;
pub use tool_mediator::*;

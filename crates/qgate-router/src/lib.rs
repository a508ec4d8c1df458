mod admin;
mod gateway;

pub use admin::{admin_router, AdminState};
pub use gateway::{gateway_router, into_axum_response, remap_model, GatewayState};

pub mod auth_routes;
pub mod forward;
pub mod responses;
pub mod tunnel_ws;

pub mod client;
pub mod dispatch;
pub mod events;
pub mod geo;
pub mod handlers;
pub mod inbound;
pub mod linkcode;
pub mod services;

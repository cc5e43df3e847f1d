#![forbid(unsafe_code)]

pub mod api;
pub mod auth;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod health;
pub mod locks;
pub mod message_log;
pub mod notify;
pub mod pagination;
pub mod permissions;
pub mod presence;
pub mod room_hub;
pub mod rooms;
pub mod sql_store;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod api_tests;


#[cfg(test)]
mod message_log_tests;

#[cfg(test)]
mod room_hub_tests;

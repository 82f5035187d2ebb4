#![forbid(unsafe_code)]

pub mod api;
pub mod health;
pub mod room_hub;
pub mod store;
pub mod subscription;
pub mod ws;

#[cfg(test)]
mod api_tests;

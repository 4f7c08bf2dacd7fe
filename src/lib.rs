pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod mqtt_service;
pub mod rest_server;
pub mod scheduler;
pub mod service_utils;

#[cfg(test)]
mod testing;

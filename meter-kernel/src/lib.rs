//! Meter state bridge: keeps one MQTT session to the meter fleet, relays what
//! the meters publish to live subscribers, sends power commands and derives
//! online/offline status from stored readings.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod fanout;
pub mod health;
pub mod http;
pub mod models;
pub mod reconcile;
pub mod router;
pub mod state;
pub mod store;
pub mod topics;

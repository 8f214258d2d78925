//! Merchant payment-transaction engine.
//!
//! Creates, submits and reconciles payment orders, refunds and outbound
//! transfers against external payment gateways, and delivers result
//! notifications back to the merchant systems that initiated them.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod services;
pub mod workers;

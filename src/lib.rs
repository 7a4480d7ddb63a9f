//! Multi-section heater cascade control host.
//!
//! Each configured heater gets a controller instance that turns temperature
//! telemetry into a pulse-width-modulated analog output and, in auto mode,
//! stages its four heating sections in and out. Heaters share one setpoint.

pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod setpoint;
pub mod sim;
pub mod store;
pub mod telemetry;
pub mod web;

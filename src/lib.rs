pub mod api;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod logging;
pub mod market;
pub mod models;
pub mod persistence;
pub mod strategy;

// Library root module for admission-gate
// This file defines the public API and module structure for the admission
// and abuse-prevention gateway
//
// Numan Thabit 2025 Nov

pub mod api;
pub mod blocklist;
pub mod budget;
pub mod config;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod quota;
pub mod reputation;
pub mod store;
pub mod window;

pub use engine::AdmissionEngine;
pub use errors::GateError;

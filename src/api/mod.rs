pub mod client;

pub use client::TrendClient;

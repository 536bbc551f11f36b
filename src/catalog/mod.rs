// 曲库服务模块

pub mod client;
pub mod types;

pub use client::CatalogClient;
pub use types::{extract_items, extract_stream_url, TrackSummary};

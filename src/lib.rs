//! Harvests links shared in social-media search results, scores them per
//! address, and republishes the most popular as an RSS feed.

pub mod config;
pub mod feed;
pub mod harvest;
pub mod search;
pub mod storage;
pub mod util;

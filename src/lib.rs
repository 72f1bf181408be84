//! Background downloader for a podcast episode queue
//!
//! Keeps a storage directory in sync with an ordered queue: fetches every
//! queued episode with resumable range requests, deletes media files that are
//! no longer queued, and records each episode's size and playback duration.

pub mod config;
pub mod downloader;
pub mod ports;
pub mod probe;
pub mod queue;

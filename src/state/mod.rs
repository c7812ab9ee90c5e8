//! State module for tracking mirror progress
//!
//! # Components
//!
//! - `SiteStatus`: Lifecycle of a remote site (pending, processing, terminal outcomes)
//! - `DownloadStatus`: Lifecycle of a single file task (discovered, downloading, completed, failed)

mod download_status;
mod site_status;

pub use download_status::DownloadStatus;
pub use site_status::SiteStatus;

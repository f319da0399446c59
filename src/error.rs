use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("instance {instance} in target group {group} has no address")]
    NoAddress { instance: usize, group: String },
    #[error("invalid target address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("invalid relabel pattern {pattern:?}: {source}")]
    InvalidRelabelPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid relabel rule: {0}")]
    InvalidRelabelRule(String),
    #[error("invalid scrape url: {0}")]
    InvalidScrapeUrl(#[from] url::ParseError),
    #[error("reading target group file {path:?}: {source}")]
    GroupFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing target group file {path:?}: {source}")]
    GroupFileFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

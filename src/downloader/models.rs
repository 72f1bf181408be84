//! Data structures for the download system
//!
//! Outcomes of a single fetch, the errors that abort one, and the states the
//! coordinator moves through.

use reqwest::StatusCode;
use std::{fmt, io};
use thiserror::Error;

/// How a single item's fetch ended, short of an I/O failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server signalled the item is unavailable (404, 410, ...).
    /// Not fatal: the walk moves on to the next item.
    Skipped { status: StatusCode },
    /// A resume request found nothing left to fetch; `size` is the local length
    AlreadyComplete { size: u64 },
    /// The file on disk now has exactly the expected length
    Complete { size: u64 },
    /// The stream ended short of the expected length, or was preempted.
    /// The partial file is kept and resumed on a later pass.
    Incomplete {
        size: u64,
        expected: Option<u64>,
        preempted: bool,
    },
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped { status } => write!(f, "Skipped ({status})"),
            Self::AlreadyComplete { size } => write!(f, "Already complete ({size} bytes)"),
            Self::Complete { size } => write!(f, "Complete ({size} bytes)"),
            Self::Incomplete {
                size,
                expected: Some(expected),
                preempted,
            } => write!(
                f,
                "Incomplete ({size} of {expected} bytes{})",
                if *preempted { ", preempted" } else { "" }
            ),
            Self::Incomplete {
                size, preempted, ..
            } => write!(
                f,
                "Incomplete ({size} bytes of unknown total{})",
                if *preempted { ", preempted" } else { "" }
            ),
        }
    }
}

/// A fetch failed outright: connecting, reading the body or writing the file.
///
/// The partial file is left in place for a later resume.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle of the download coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Idle,
    Running,
    Stopping,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// How a walk over one snapshot ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// Every item was visited
    Finished,
    /// A pending snapshot appeared; the rest of the walk was abandoned
    Preempted,
    /// An item failed with an I/O error and the failure policy aborts the walk
    Aborted,
    /// A stop was requested
    Stopped,
}

/// What to do with the rest of a walk when one item fails with an I/O error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abandon the walk; the item is retried on the next run
    #[default]
    AbortWalk,
    /// Move on to the next item
    SkipItem,
}

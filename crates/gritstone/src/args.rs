//! Consistency and durability argument grammars.
//!
//! These mirror the store's CLI knobs: a consistency policy is either a
//! named level or a bounded-staleness `lag=<ms>,timeout=<ms>` pair, and a
//! durability policy is either a named commit level or an explicit
//! `masterSync=..,replicaSync=..,replicaAck=..` triple. Parse failures are
//! configuration errors and abort before any operation runs.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from parsing consistency/durability argument strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("invalid {what} argument: {input:?}")]
    Invalid { what: &'static str, input: String },

    #[error("invalid {what} field {field:?} in {input:?}")]
    InvalidField {
        what: &'static str,
        field: String,
        input: String,
    },
}

// ============================================================================
// Consistency
// ============================================================================

/// Read-staleness policy for store reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Reads must observe the most recent committed state.
    Absolute,
    /// Any replica may serve the read.
    NoneRequired,
    /// Any replica except the master may serve the read.
    NoneRequiredNoMaster,
    /// Bounded staleness: the replica must be within `lag_ms` of the master,
    /// waiting up to `timeout_ms` to catch up.
    TimeLag { lag_ms: u64, timeout_ms: u64 },
}

impl FromStr for Consistency {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ABSOLUTE" => Ok(Consistency::Absolute),
            "NONE_REQUIRED" => Ok(Consistency::NoneRequired),
            "NONE_REQUIRED_NO_MASTER" => Ok(Consistency::NoneRequiredNoMaster),
            _ if s.contains('=') => parse_time_lag(s),
            _ => Err(ArgError::Invalid {
                what: "consistency",
                input: s.to_string(),
            }),
        }
    }
}

fn parse_time_lag(s: &str) -> Result<Consistency, ArgError> {
    let mut lag_ms = None;
    let mut timeout_ms = None;

    for field in s.split(',') {
        let (key, value) = field.split_once('=').ok_or_else(|| ArgError::InvalidField {
            what: "consistency",
            field: field.to_string(),
            input: s.to_string(),
        })?;
        let parsed: u64 = value.parse().map_err(|_| ArgError::InvalidField {
            what: "consistency",
            field: field.to_string(),
            input: s.to_string(),
        })?;
        match key {
            "lag" => lag_ms = Some(parsed),
            "timeout" => timeout_ms = Some(parsed),
            _ => {
                return Err(ArgError::InvalidField {
                    what: "consistency",
                    field: field.to_string(),
                    input: s.to_string(),
                });
            }
        }
    }

    match (lag_ms, timeout_ms) {
        (Some(lag_ms), Some(timeout_ms)) => Ok(Consistency::TimeLag { lag_ms, timeout_ms }),
        _ => Err(ArgError::Invalid {
            what: "consistency",
            input: s.to_string(),
        }),
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consistency::Absolute => write!(f, "ABSOLUTE"),
            Consistency::NoneRequired => write!(f, "NONE_REQUIRED"),
            Consistency::NoneRequiredNoMaster => write!(f, "NONE_REQUIRED_NO_MASTER"),
            Consistency::TimeLag { lag_ms, timeout_ms } => {
                write!(f, "lag={lag_ms},timeout={timeout_ms}")
            }
        }
    }
}

// ============================================================================
// Durability
// ============================================================================

/// Disk-sync policy for one side of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    Sync,
    NoSync,
    WriteNoSync,
}

impl FromStr for SyncPolicy {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNC" => Ok(SyncPolicy::Sync),
            "NO_SYNC" => Ok(SyncPolicy::NoSync),
            "WRITE_NO_SYNC" => Ok(SyncPolicy::WriteNoSync),
            _ => Err(ArgError::Invalid {
                what: "sync policy",
                input: s.to_string(),
            }),
        }
    }
}

/// How many replicas must acknowledge a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaAckPolicy {
    All,
    None,
    SimpleMajority,
}

impl FromStr for ReplicaAckPolicy {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALL" => Ok(ReplicaAckPolicy::All),
            "NONE" => Ok(ReplicaAckPolicy::None),
            "SIMPLE_MAJORITY" => Ok(ReplicaAckPolicy::SimpleMajority),
            _ => Err(ArgError::Invalid {
                what: "replica ack policy",
                input: s.to_string(),
            }),
        }
    }
}

/// Write-durability policy for store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    CommitNoSync,
    CommitSync,
    CommitWriteNoSync,
    Custom {
        master_sync: SyncPolicy,
        replica_sync: SyncPolicy,
        replica_ack: ReplicaAckPolicy,
    },
}

impl FromStr for Durability {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMMIT_NO_SYNC" => Ok(Durability::CommitNoSync),
            "COMMIT_SYNC" => Ok(Durability::CommitSync),
            "COMMIT_WRITE_NO_SYNC" => Ok(Durability::CommitWriteNoSync),
            _ if s.contains('=') => parse_custom_durability(s),
            _ => Err(ArgError::Invalid {
                what: "durability",
                input: s.to_string(),
            }),
        }
    }
}

fn parse_custom_durability(s: &str) -> Result<Durability, ArgError> {
    let mut master_sync = None;
    let mut replica_sync = None;
    let mut replica_ack = None;

    for field in s.split(',') {
        let (key, value) = field.split_once('=').ok_or_else(|| ArgError::InvalidField {
            what: "durability",
            field: field.to_string(),
            input: s.to_string(),
        })?;
        match key {
            "masterSync" => master_sync = Some(value.parse()?),
            "replicaSync" => replica_sync = Some(value.parse()?),
            "replicaAck" => replica_ack = Some(value.parse()?),
            _ => {
                return Err(ArgError::InvalidField {
                    what: "durability",
                    field: field.to_string(),
                    input: s.to_string(),
                });
            }
        }
    }

    match (master_sync, replica_sync, replica_ack) {
        (Some(master_sync), Some(replica_sync), Some(replica_ack)) => Ok(Durability::Custom {
            master_sync,
            replica_sync,
            replica_ack,
        }),
        _ => Err(ArgError::Invalid {
            what: "durability",
            input: s.to_string(),
        }),
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Durability::CommitNoSync => write!(f, "COMMIT_NO_SYNC"),
            Durability::CommitSync => write!(f, "COMMIT_SYNC"),
            Durability::CommitWriteNoSync => write!(f, "COMMIT_WRITE_NO_SYNC"),
            Durability::Custom {
                master_sync,
                replica_sync,
                replica_ack,
            } => write!(
                f,
                "masterSync={master_sync:?},replicaSync={replica_sync:?},replicaAck={replica_ack:?}"
            ),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ABSOLUTE", Consistency::Absolute; "absolute")]
    #[test_case("NONE_REQUIRED", Consistency::NoneRequired; "none required")]
    #[test_case("NONE_REQUIRED_NO_MASTER", Consistency::NoneRequiredNoMaster; "no master")]
    fn parse_named_consistency(input: &str, expected: Consistency) {
        assert_eq!(input.parse(), Ok(expected));
    }

    #[test]
    fn parse_time_lag_consistency() {
        assert_eq!(
            "lag=100,timeout=500".parse(),
            Ok(Consistency::TimeLag {
                lag_ms: 100,
                timeout_ms: 500
            })
        );
        // Field order does not matter.
        assert_eq!(
            "timeout=500,lag=100".parse(),
            Ok(Consistency::TimeLag {
                lag_ms: 100,
                timeout_ms: 500
            })
        );
    }

    #[test]
    fn reject_bad_consistency() {
        assert!("absolute".parse::<Consistency>().is_err());
        assert!("lag=100".parse::<Consistency>().is_err());
        assert!("lag=x,timeout=500".parse::<Consistency>().is_err());
        assert!("lag=1,budget=5".parse::<Consistency>().is_err());
    }

    #[test]
    fn parse_named_durability() {
        assert_eq!("COMMIT_NO_SYNC".parse(), Ok(Durability::CommitNoSync));
        assert_eq!("COMMIT_SYNC".parse(), Ok(Durability::CommitSync));
        assert_eq!(
            "COMMIT_WRITE_NO_SYNC".parse(),
            Ok(Durability::CommitWriteNoSync)
        );
    }

    #[test]
    fn parse_custom_durability_triple() {
        assert_eq!(
            "masterSync=SYNC,replicaSync=NO_SYNC,replicaAck=SIMPLE_MAJORITY".parse(),
            Ok(Durability::Custom {
                master_sync: SyncPolicy::Sync,
                replica_sync: SyncPolicy::NoSync,
                replica_ack: ReplicaAckPolicy::SimpleMajority,
            })
        );
    }

    #[test]
    fn reject_partial_custom_durability() {
        assert!(
            "masterSync=SYNC,replicaSync=NO_SYNC"
                .parse::<Durability>()
                .is_err()
        );
        assert!("masterSync=FAST".parse::<Durability>().is_err());
    }

    #[test]
    fn consistency_display_round_trips() {
        for s in ["ABSOLUTE", "NONE_REQUIRED", "lag=5,timeout=20"] {
            let parsed: Consistency = s.parse().unwrap();
            assert_eq!(parsed.to_string().parse::<Consistency>().unwrap(), parsed);
        }
    }
}

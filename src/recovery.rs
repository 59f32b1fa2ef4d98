//! Coordinator crash recovery
//!
//! On startup the log directory is scanned and every commit log replayed.
//! The markers present decide what is left to do:
//!
//! - `DONE`: nothing; the commit is never reprocessed.
//! - `Phase Two: <decision>`: the decision is known; rebroadcast it and
//!   collect acks.
//! - `Phase One` only: no participant can have seen a decision, so abort
//!   is safe; the composite may exist partially written and is deleted.
//! - neither: the commit died before any outbound effect; abort silently,
//!   with no participant traffic.
//!
//! Recovery drivers run concurrently and are all joined before the single
//! recovered barrier flips and new `start_commit` calls proceed. Inbound
//! acks for recovering commits are routed normally throughout, since every
//! driver registers its queues before sending anything.

use crate::commit_log::{self, CommitLogReplay, CommitLogWriter};
use crate::coordinator::{Coordinator, DriverStart};
use crate::types::Decision;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// What a replayed commit log requires of recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// `DONE` logged; skip
    Skip,
    /// Decision durably known; redo Phase II only
    PhaseTwoRecover(Decision),
    /// Interrupted during Phase I; abort with participant traffic
    PhaseOneAbort,
    /// Died before Phase I; abort with no participant traffic
    SilentAbort,
}

/// Classify a replayed log into its recovery action.
pub fn classify(replayed: &CommitLogReplay) -> RecoveryAction {
    if replayed.done {
        RecoveryAction::Skip
    } else if let Some(decision) = replayed.phase_two {
        RecoveryAction::PhaseTwoRecover(decision)
    } else if replayed.phase_one {
        RecoveryAction::PhaseOneAbort
    } else {
        RecoveryAction::SilentAbort
    }
}

impl Coordinator {
    /// Scan the log directory, finish every interrupted commit, then open
    /// the gate for new traffic. Must run before `start_commit` is used;
    /// the listener may already be up, since recovering commits route
    /// their acks through the normal router.
    pub async fn recover(self: &Arc<Self>) -> io::Result<()> {
        let logs = commit_log::scan_log_dir(&self.log_dir())?;
        let mut drivers = Vec::new();

        for path in logs {
            let replayed = commit_log::replay(&path)?;
            let action = classify(&replayed);

            let file_name = match replayed.file_name.clone() {
                Some(name) => name,
                None => {
                    // Crashed before even the header line made it out.
                    warn!(log = %path.display(), "commit log has no file name; closing it out");
                    let writer = CommitLogWriter::reopen(&path)?;
                    writer.log_phase_two(Decision::Abort)?;
                    writer.log_done()?;
                    continue;
                }
            };

            match action {
                RecoveryAction::Skip => continue,
                RecoveryAction::SilentAbort => {
                    info!(commit = %file_name, "aborting commit that never started phase one");
                    let writer = CommitLogWriter::reopen(&path)?;
                    writer.log_phase_two(Decision::Abort)?;
                    writer.log_done()?;
                }
                RecoveryAction::PhaseTwoRecover(decision) => {
                    info!(commit = %file_name, decision = %decision, "recovering commit in phase two");
                    let writer = CommitLogWriter::reopen(&path)?;
                    drivers.push(self.spawn_driver(
                        &file_name,
                        &replayed.sources,
                        None,
                        writer,
                        DriverStart::PhaseTwoRecover(decision),
                    ));
                }
                RecoveryAction::PhaseOneAbort => {
                    info!(commit = %file_name, "recovering commit interrupted in phase one");
                    let writer = CommitLogWriter::reopen(&path)?;
                    drivers.push(self.spawn_driver(
                        &file_name,
                        &replayed.sources,
                        None,
                        writer,
                        DriverStart::PhaseOneAbort,
                    ));
                }
            }
        }

        let recovering = drivers.len();
        for driver in drivers {
            let _ = driver.await;
        }
        if recovering > 0 {
            info!(commits = recovering, "recovery complete");
        }

        self.recovered.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceRef;

    fn replayed(
        phase_one: bool,
        phase_two: Option<Decision>,
        done: bool,
    ) -> CommitLogReplay {
        CommitLogReplay {
            file_name: Some("c.jpg".to_string()),
            sources: vec![SourceRef::new("a", "1.jpg")],
            phase_one,
            phase_two,
            done,
        }
    }

    #[test]
    fn test_done_commit_is_skipped() {
        let r = replayed(true, Some(Decision::Yes), true);
        assert_eq!(classify(&r), RecoveryAction::Skip);
    }

    #[test]
    fn test_logged_decision_redoes_phase_two_only() {
        for decision in [Decision::Yes, Decision::No, Decision::Abort] {
            let r = replayed(true, Some(decision), false);
            assert_eq!(classify(&r), RecoveryAction::PhaseTwoRecover(decision));
        }
    }

    #[test]
    fn test_phase_one_only_aborts_with_traffic() {
        let r = replayed(true, None, false);
        assert_eq!(classify(&r), RecoveryAction::PhaseOneAbort);
    }

    #[test]
    fn test_header_only_aborts_silently() {
        let r = replayed(false, None, false);
        assert_eq!(classify(&r), RecoveryAction::SilentAbort);
    }
}

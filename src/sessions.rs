//! Decide which uploaded sessions contribute to a commit's merged report.
//!
//! Direct uploads always supersede carried-forward sessions for the same
//! flag. A carried-forward session is dropped only when *every* one of its
//! flags has a direct upload; unflagged sessions are never dropped.
use std::collections::{BTreeMap, BTreeSet};

use crate::model::Session;

/// Outcome of resolving a commit's sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionResolution {
    /// Ids of sessions whose lines make it into the report.
    pub included: BTreeSet<u32>,
    /// Carried-forward sessions replaced by direct uploads.
    pub superseded: BTreeSet<u32>,
}

impl SessionResolution {
    #[must_use]
    pub fn excludes_any(&self) -> bool {
        !self.superseded.is_empty()
    }
}

/// Flags covered by at least one direct (non carried-forward) upload.
pub fn direct_flags<'a, I>(sessions: I) -> BTreeSet<&'a str>
where
    I: IntoIterator<Item = &'a Session>,
{
    sessions
        .into_iter()
        .filter(|s| !s.is_carried_forward())
        .flat_map(|s| s.flags.iter().map(String::as_str))
        .collect()
}

/// True when every flag of a carried-forward `session` has a direct upload.
#[must_use]
pub fn is_superseded(session: &Session, direct: &BTreeSet<&str>) -> bool {
    session.is_carried_forward()
        && !session.flags.is_empty()
        && session.flags.iter().all(|f| direct.contains(f.as_str()))
}

/// Partition a commit's sessions into included and superseded ids.
pub fn resolve(sessions: &BTreeMap<u32, Session>) -> SessionResolution {
    let direct = direct_flags(sessions.values());
    let mut resolution = SessionResolution::default();

    for session in sessions.values() {
        if is_superseded(session, &direct) {
            tracing::debug!(
                session = session.id,
                flags = ?session.flags,
                "carried-forward session superseded by direct upload"
            );
            resolution.superseded.insert(session.id);
        } else {
            resolution.included.insert(session.id);
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sessions(list: Vec<Session>) -> BTreeMap<u32, Session> {
        list.into_iter().map(|s| (s.id, s)).collect()
    }

    #[test]
    fn test_direct_upload_supersedes_carry_forward() {
        let resolution = resolve(&sessions(vec![
            Session::new(0).with_flags(["flag-a"]),
            Session::new(1).with_flags(["flag-a"]).carried_forward(Some("abc")),
        ]));
        assert_eq!(resolution.included, BTreeSet::from([0]));
        assert_eq!(resolution.superseded, BTreeSet::from([1]));
        assert!(resolution.excludes_any());
    }

    #[test]
    fn test_carry_forward_without_competitor_is_kept() {
        let resolution = resolve(&sessions(vec![
            Session::new(0).with_flags(["flag-a"]),
            Session::new(1).with_flags(["flag-b"]).carried_forward(None),
        ]));
        assert_eq!(resolution.included, BTreeSet::from([0, 1]));
        assert!(!resolution.excludes_any());
    }

    #[test]
    fn test_partially_superseded_multi_flag_session_is_kept() {
        let resolution = resolve(&sessions(vec![
            Session::new(0).with_flags(["flag-a"]),
            Session::new(1)
                .with_flags(["flag-a", "flag-b"])
                .carried_forward(None),
        ]));
        assert_eq!(resolution.included, BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_fully_superseded_multi_flag_session_is_dropped() {
        let resolution = resolve(&sessions(vec![
            Session::new(0).with_flags(["flag-a"]),
            Session::new(1).with_flags(["flag-b"]),
            Session::new(2)
                .with_flags(["flag-a", "flag-b"])
                .carried_forward(None),
        ]));
        assert_eq!(resolution.included, BTreeSet::from([0, 1]));
        assert_eq!(resolution.superseded, BTreeSet::from([2]));
    }

    #[test]
    fn test_unflagged_sessions_are_never_dropped() {
        let resolution = resolve(&sessions(vec![
            Session::new(0),
            Session::new(1).carried_forward(None),
        ]));
        assert_eq!(resolution.included, BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_carry_forward_does_not_supersede_carry_forward() {
        let resolution = resolve(&sessions(vec![
            Session::new(0).with_flags(["flag-a"]).carried_forward(None),
            Session::new(1).with_flags(["flag-a"]).carried_forward(None),
        ]));
        assert_eq!(resolution.included, BTreeSet::from([0, 1]));
    }
}

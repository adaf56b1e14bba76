use std::collections::HashMap;
use anyhow::bail;
use chrono::{NaiveDate, NaiveDateTime};
use crate::session::{ExceptionKind, ExceptionRecord};

/// One dated occurrence of a series after exceptions were applied.
/// original_date is the calendar date the occurrence would have had without
/// any retiming, it stays the join key for booking counts.
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct EffectiveOccurrence {
    pub start_time: NaiveDateTime,
    pub original_date: NaiveDate,
    pub is_exception: bool,
}

/// Overlays per-date exceptions on the expanded occurrence list of one
/// series. Exceptions match on the calendar date of the un-overridden
/// occurrence, a cancelled exception drops the occurrence, a modified one
/// replaces the instant. Exceptions for dates not present in the list are
/// ignored.
pub fn apply(instants: &[NaiveDateTime], exceptions: &[ExceptionRecord]) -> anyhow::Result<Vec<EffectiveOccurrence>> {
    let by_date: HashMap<NaiveDate, &ExceptionRecord> = exceptions.iter()
        .map(|x| (x.original_date, x))
        .collect();
    let mut occurrences = Vec::with_capacity(instants.len());
    for &t in instants {
        let original_date = t.date();
        match by_date.get(&original_date) {
            None => {
                occurrences.push(EffectiveOccurrence { start_time: t, original_date, is_exception: false });
            }
            Some(x) => match x.kind {
                ExceptionKind::Cancelled => {}
                ExceptionKind::Modified => {
                    let Some(new_start) = x.new_start else {
                        bail!("Modified exception id={} has no replacement start time", x.id);
                    };
                    occurrences.push(EffectiveOccurrence { start_time: new_start, original_date, is_exception: true });
                }
            },
        }
    }
    Ok(occurrences)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::recurrence::{expand, RecurrencePattern};

    fn dt(s: &str) -> NaiveDateTime {
        s.parse().unwrap()
    }
    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }
    fn cancelled(date: &str) -> ExceptionRecord {
        ExceptionRecord {
            id: 1,
            session_id: 1,
            original_date: d(date),
            kind: ExceptionKind::Cancelled,
            new_start: None,
        }
    }
    fn modified(date: &str, new_start: &str) -> ExceptionRecord {
        ExceptionRecord {
            id: 2,
            session_id: 1,
            original_date: d(date),
            kind: ExceptionKind::Modified,
            new_start: Some(dt(new_start)),
        }
    }

    #[test]
    fn test_cancel_removes_exactly_one_date() {
        let instants = vec![dt("2026-03-02T09:00:00"), dt("2026-03-09T09:00:00"), dt("2026-03-16T09:00:00")];
        let occurrences = apply(&instants, &[cancelled("2026-03-09")]).unwrap();
        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0].original_date, d("2026-03-02"));
        assert_eq!(occurrences[1].original_date, d("2026-03-16"));
        assert!(occurrences.iter().all(|o| !o.is_exception));
    }

    #[test]
    fn test_modify_keeps_original_date() {
        let instants = vec![dt("2026-03-02T09:00:00")];
        let occurrences = apply(&instants, &[modified("2026-03-02", "2026-03-02T10:00:00")]).unwrap();
        assert_eq!(occurrences.len(), 1);
        assert_eq!(occurrences[0].start_time, dt("2026-03-02T10:00:00"));
        assert_eq!(occurrences[0].original_date, d("2026-03-02"));
        assert!(occurrences[0].is_exception);
    }

    #[test]
    fn test_out_of_window_exception_is_ignored() {
        let instants = vec![dt("2026-03-02T09:00:00")];
        let occurrences = apply(&instants, &[cancelled("2026-04-06")]).unwrap();
        assert_eq!(occurrences.len(), 1);
        assert!(!occurrences[0].is_exception);
    }

    #[test]
    fn test_modified_without_new_start_is_an_error() {
        let mut x = modified("2026-03-02", "2026-03-02T10:00:00");
        x.new_start = None;
        assert!(apply(&[dt("2026-03-02T09:00:00")], &[x]).is_err());
    }

    #[test]
    fn test_weekly_series_with_cancel_and_retime() {
        // weekly Monday 09:00, three week window, week 2 cancelled,
        // week 3 moved to 10:00
        let instants = expand(
            dt("2026-03-02T09:00:00"),
            RecurrencePattern::Weekly,
            None,
            None,
            dt("2026-03-02T00:00:00"),
            dt("2026-03-22T23:59:59"),
        ).unwrap();
        let occurrences = apply(&instants, &[
            cancelled("2026-03-09"),
            modified("2026-03-16", "2026-03-16T10:00:00"),
        ]).unwrap();
        assert_eq!(occurrences, vec![
            EffectiveOccurrence { start_time: dt("2026-03-02T09:00:00"), original_date: d("2026-03-02"), is_exception: false },
            EffectiveOccurrence { start_time: dt("2026-03-16T10:00:00"), original_date: d("2026-03-16"), is_exception: true },
        ]);
    }
}

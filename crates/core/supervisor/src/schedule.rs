//! Progress-callback interval schedules.

/// An ordered list of intervals, in seconds, driving progress callbacks.
///
/// After each entry elapses the callback fires with the *next* interval as
/// its argument; once the list is exhausted the final interval repeats
/// indefinitely. Callers typically use the argument to extend a job's
/// database `timeout` to cover the next expected quiet period.
#[derive(Debug, Clone)]
pub struct IntervalSchedule(Vec<u64>);

impl IntervalSchedule {
    /// Build a schedule from a non-empty interval list.
    ///
    /// Empty input falls back to the default schedule; zero entries are
    /// clamped to one second so the supervisor never busy-loops.
    pub fn new(intervals: impl Into<Vec<u64>>) -> Self {
        let intervals: Vec<u64> = intervals
            .into()
            .into_iter()
            .map(|secs| secs.max(1))
            .collect();
        if intervals.is_empty() {
            Self::default()
        } else {
            Self(intervals)
        }
    }

    /// Iterate the schedule: each entry once, then the last one forever.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let last = self.0.last().copied().unwrap_or(1);
        self.0.iter().copied().chain(std::iter::repeat(last))
    }
}

impl Default for IntervalSchedule {
    /// The standard schedule: report quickly at first, then settle down.
    fn default() -> Self {
        Self(vec![1, 1, 5, 30])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iter_repeats_the_final_interval() {
        //* Given
        let schedule = IntervalSchedule::new(vec![1, 1, 5, 30]);

        //* When
        let head: Vec<u64> = schedule.iter().take(7).collect();

        //* Then
        assert_eq!(head, vec![1, 1, 5, 30, 30, 30, 30]);
    }

    #[test]
    fn empty_input_falls_back_to_default() {
        let schedule = IntervalSchedule::new(Vec::new());
        let head: Vec<u64> = schedule.iter().take(4).collect();
        assert_eq!(head, vec![1, 1, 5, 30]);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let schedule = IntervalSchedule::new(vec![0, 0]);
        let head: Vec<u64> = schedule.iter().take(3).collect();
        assert_eq!(head, vec![1, 1, 1]);
    }
}

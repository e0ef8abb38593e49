// repair-pipeline-rs/src/consensus.rs
// Majority-vote reduction of noisy nearest-neighbor hits to a single
// best-precedent id.

/// Calling the resolver with zero candidates is a programming error: the
/// pipeline checks hit counts before voting.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("majority vote requires at least one candidate")]
    EmptyInput,
}

/// Outcome of a vote. A tied maximum and a below-threshold maximum are
/// the same result: no winner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MajorityOutcome<T> {
    Winner { value: T, count: usize, total: usize },
    NoWinner { count: usize, total: usize },
}

impl<T> MajorityOutcome<T> {
    pub fn winner(&self) -> Option<&T> {
        match self {
            MajorityOutcome::Winner { value, .. } => Some(value),
            MajorityOutcome::NoWinner { .. } => None,
        }
    }
}

/// Majority vote with default value equality.
pub fn majority_vote<T: PartialEq + Clone>(
    values: &[T],
) -> Result<MajorityOutcome<T>, ConsensusError> {
    majority_vote_by(values, |a, b| a == b)
}

/// Majority vote with caller-supplied equality. Input order never
/// affects the result. A winner exists only when one candidate's count
/// is the unique maximum and reaches `floor(n/2) + 1`.
pub fn majority_vote_by<T: Clone>(
    values: &[T],
    eq: impl Fn(&T, &T) -> bool,
) -> Result<MajorityOutcome<T>, ConsensusError> {
    if values.is_empty() {
        return Err(ConsensusError::EmptyInput);
    }

    let total = values.len();
    let threshold = total / 2 + 1;

    let mut counts: Vec<(T, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(seen, _)| eq(seen, value)) {
            Some(entry) => entry.1 += 1,
            None => counts.push((value.clone(), 1)),
        }
    }

    let max_count = counts.iter().map(|(_, c)| *c).max().unwrap_or(0);
    let max_is_unique = counts.iter().filter(|(_, c)| *c == max_count).count() == 1;

    if max_is_unique && max_count >= threshold {
        let (value, count) = counts
            .into_iter()
            .find(|(_, c)| *c == max_count)
            .expect("max count exists");
        Ok(MajorityOutcome::Winner {
            value,
            count,
            total,
        })
    } else {
        Ok(MajorityOutcome::NoWinner {
            count: max_count,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_majority_wins() {
        let result = majority_vote(&[1, 1, 1, 2, 3]).unwrap();
        assert_eq!(
            result,
            MajorityOutcome::Winner {
                value: 1,
                count: 3,
                total: 5
            }
        );
    }

    #[test]
    fn all_distinct_values_produce_no_winner() {
        let result = majority_vote(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(result.winner(), None);
        assert!(matches!(result, MajorityOutcome::NoWinner { .. }));
    }

    #[test]
    fn tied_maximum_below_threshold_produces_no_winner() {
        let result = majority_vote(&[1, 1, 2, 2]).unwrap();
        assert_eq!(result.winner(), None);
        assert_eq!(result, MajorityOutcome::NoWinner { count: 2, total: 4 });
    }

    #[test]
    fn empty_input_is_an_error() {
        let result = majority_vote::<i64>(&[]);
        assert_eq!(result, Err(ConsensusError::EmptyInput));
    }

    #[test]
    fn single_element_always_wins() {
        let result = majority_vote(&[42]).unwrap();
        assert_eq!(
            result,
            MajorityOutcome::Winner {
                value: 42,
                count: 1,
                total: 1
            }
        );
    }

    #[test]
    fn two_identical_elements_win() {
        let result = majority_vote(&[5, 5]).unwrap();
        assert_eq!(
            result,
            MajorityOutcome::Winner {
                value: 5,
                count: 2,
                total: 2
            }
        );
    }

    #[test]
    fn string_values_vote_by_value() {
        let values = vec!["a", "b", "a", "a"];
        let result = majority_vote(&values).unwrap();
        assert_eq!(result.winner(), Some(&"a"));
    }

    #[test]
    fn custom_equality_groups_candidates() {
        #[derive(Debug, Clone, PartialEq)]
        struct Hit {
            id: i64,
            name: &'static str,
        }

        let hits = vec![
            Hit { id: 1, name: "a" },
            Hit { id: 1, name: "b" },
            Hit { id: 1, name: "c" },
            Hit { id: 2, name: "d" },
        ];

        let result = majority_vote_by(&hits, |a, b| a.id == b.id).unwrap();
        match result {
            MajorityOutcome::Winner { value, count, .. } => {
                assert_eq!(value.id, 1);
                assert_eq!(count, 3);
            }
            MajorityOutcome::NoWinner { .. } => panic!("expected a winner"),
        }
    }

    #[test]
    fn input_order_does_not_change_the_result() {
        let forward = majority_vote(&[7, 7, 8, 7]).unwrap();
        let shuffled = majority_vote(&[8, 7, 7, 7]).unwrap();
        assert_eq!(forward, shuffled);
    }
}

//! Quorum arithmetic

/// Minimum amount of guardian signatures required for an attestation to be valid
///
/// `⌊n·2/3⌋ + 1`, i.e. strictly more than two thirds of the guardian set.
pub fn calculate_quorum(num_guardians: usize) -> usize {
    num_guardians * 2 / 3 + 1
}

/// Maximum amount of byzantine guardians the reliable broadcast tolerates for given
/// non-inclusive signing threshold
pub fn max_broadcast_faults(threshold: usize) -> usize {
    threshold / 2
}

/// Amount of echoes required to deliver a broadcasted message
pub fn delivery_quorum(threshold: usize) -> usize {
    2 * max_broadcast_faults(threshold) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_table() {
        let table = [
            (1, 1),
            (2, 2),
            (3, 3),
            (4, 3),
            (5, 4),
            (6, 5),
            (7, 5),
            (8, 6),
            (9, 7),
            (10, 7),
            (19, 13),
            (20, 14),
            (100, 67),
        ];
        for (n, quorum) in table {
            assert_eq!(calculate_quorum(n), quorum, "n = {n}");
        }
    }

    #[test]
    fn matches_float_formula() {
        for n in 1..1000usize {
            let expected = ((n as f64) / 3.0 * 2.0) as usize + 1;
            assert_eq!(calculate_quorum(n), expected, "n = {n}");
        }
    }

    #[test]
    fn broadcast_thresholds() {
        assert_eq!(max_broadcast_faults(2), 1);
        assert_eq!(delivery_quorum(2), 3);
        assert_eq!(delivery_quorum(12), 13);
        assert_eq!(delivery_quorum(0), 1);
    }
}

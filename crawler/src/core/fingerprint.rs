//! Fingerprint comparison.
//!
//! Fingerprints are fixed-width lowercase hex strings; similarity is the
//! Hamming distance over their bits.

/// Largest Hamming distance still treated as the same screen.
pub const MAX_MATCH_DISTANCE: u32 = 5;

/// Bit distance between two fingerprints, or `None` when they are not
/// comparable (invalid hex or different widths).
pub fn hamming_distance(lhs: &str, rhs: &str) -> Option<u32> {
    let left = hex::decode(lhs).ok()?;
    let right = hex::decode(rhs).ok()?;
    if left.len() != right.len() {
        return None;
    }
    Some(
        left.iter()
            .zip(&right)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum(),
    )
}

/// Pick the candidate closest to `fingerprint` within `max_distance`.
///
/// Ties on distance go to the earliest candidate in iteration order.
pub fn closest_match<'a, T, I>(
    fingerprint: &str,
    candidates: I,
    max_distance: u32,
) -> Option<(T, u32)>
where
    I: IntoIterator<Item = (T, &'a str)>,
{
    let mut best: Option<(T, u32)> = None;
    for (item, candidate) in candidates {
        let Some(distance) = hamming_distance(fingerprint, candidate) else {
            continue;
        };
        if distance > max_distance {
            continue;
        }
        match &best {
            Some((_, best_distance)) if *best_distance <= distance => {}
            _ => best = Some((item, distance)),
        }
    }
    best
}

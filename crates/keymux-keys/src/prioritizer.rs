//! Pure candidate ordering for key selection. No IO, no locking.

use std::cmp::Ordering;

use crate::key::Key;

/// Provider-specific tiebreaker applied between the rate-limit ordering and
/// the least-recently-used fallback. `Ordering::Less` means "prefer a".
pub type Tiebreaker<'a> = &'a (dyn Fn(&Key, &Key) -> Ordering + Send + Sync);

/// Sorts highest-preference first:
///
/// 1. keys whose lockout has elapsed before keys still locked out;
/// 2. among locked-out keys, the earliest `rate_limited_until`;
/// 3. the caller's tiebreaker, if any;
/// 4. least-recently-used.
///
/// The sort is stable, so equal candidates keep their configured order.
pub fn prioritize(candidates: &mut [Key], now: u64, tiebreaker: Option<Tiebreaker<'_>>) {
    candidates.sort_by(|a, b| compare(a, b, now, tiebreaker));
}

fn compare(a: &Key, b: &Key, now: u64, tiebreaker: Option<Tiebreaker<'_>>) -> Ordering {
    let a_limited = a.is_rate_limited(now);
    let b_limited = b.is_rate_limited(now);
    match (a_limited, b_limited) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        (true, true) => {
            let by_until = a.rate_limited_until.cmp(&b.rate_limited_until);
            if by_until != Ordering::Equal {
                return by_until;
            }
        }
        (false, false) => {}
    }
    if let Some(tiebreaker) = tiebreaker {
        let custom = tiebreaker(a, b);
        if custom != Ordering::Equal {
            return custom;
        }
    }
    a.last_used.cmp(&b.last_used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{ModelFamily, Service};
    use crate::key::KeyDetail;

    fn key(secret: &str) -> Key {
        Key::new(
            Service::Mistral,
            secret,
            [ModelFamily::MistralSmall],
            KeyDetail::Mistral,
        )
    }

    #[test]
    fn unlimited_before_limited_then_lru() {
        let now = 10_000;
        let mut limited = key("a");
        limited.rate_limited_until = now + 5_000;
        let mut fresh_but_recent = key("b");
        fresh_but_recent.last_used = 9_000;
        let mut fresh_and_stale = key("c");
        fresh_and_stale.last_used = 1_000;

        let mut candidates = vec![limited.clone(), fresh_but_recent.clone(), fresh_and_stale.clone()];
        prioritize(&mut candidates, now, None);
        assert_eq!(candidates[0].hash, fresh_and_stale.hash);
        assert_eq!(candidates[1].hash, fresh_but_recent.hash);
        assert_eq!(candidates[2].hash, limited.hash);
    }

    #[test]
    fn limited_keys_sorted_by_earliest_recovery() {
        let now = 10_000;
        let mut soon = key("a");
        soon.rate_limited_until = now + 100;
        let mut late = key("b");
        late.rate_limited_until = now + 9_000;

        let mut candidates = vec![late.clone(), soon.clone()];
        prioritize(&mut candidates, now, None);
        assert_eq!(candidates[0].hash, soon.hash);
    }

    #[test]
    fn tiebreaker_runs_before_lru() {
        let now = 10_000;
        let mut preferred = key("a");
        preferred.last_used = 9_999;
        let mut other = key("b");
        other.last_used = 0;
        let preferred_hash = preferred.hash.clone();

        let tiebreak = |a: &Key, b: &Key| -> std::cmp::Ordering {
            let a_hit = a.hash == preferred_hash;
            let b_hit = b.hash == preferred_hash;
            b_hit.cmp(&a_hit)
        };

        let mut candidates = vec![other.clone(), preferred.clone()];
        prioritize(&mut candidates, now, Some(&tiebreak));
        assert_eq!(candidates[0].hash, preferred.hash);
    }
}

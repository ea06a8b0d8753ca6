use ulid::Ulid;

use crate::model::*;

/// Commitments held against one room or article.
#[derive(Debug, Clone)]
pub struct LedgerState {
    pub key: ResourceKey,
    /// Sorted by `span.start`.
    pub commitments: Vec<Commitment>,
}

impl LedgerState {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            commitments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, commitment: Commitment) {
        let pos = self
            .commitments
            .binary_search_by_key(&commitment.span.start, |c| c.span.start)
            .unwrap_or_else(|e| e);
        self.commitments.insert(pos, commitment);
    }

    /// Remove the row owned by a reservation.
    pub fn remove(&mut self, reservation_id: Ulid) -> Option<Commitment> {
        let pos = self
            .commitments
            .iter()
            .position(|c| c.reservation_id == reservation_id)?;
        Some(self.commitments.remove(pos))
    }

    pub fn get(&self, reservation_id: Ulid) -> Option<&Commitment> {
        self.commitments
            .iter()
            .find(|c| c.reservation_id == reservation_id)
    }

    /// Return only commitments whose span overlaps the query window.
    /// Uses binary search to skip commitments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Commitment> {
        let right_bound = self
            .commitments
            .partition_point(|c| c.span.start < query.end);
        self.commitments[..right_bound]
            .iter()
            .filter(move |c| c.span.end > query.start)
    }

    /// Quantity of this resource already held over `window` by reservations other than `excluding`.
    ///
    /// Rooms answer 0 or 1. Articles sum direct units and attached quantities of every
    /// overlapping reservation.
    pub fn committed(&self, window: &Span, excluding: Option<Ulid>) -> u32 {
        match self.key {
            ResourceKey::Room(_) => u32::from(self.first_conflict(window, excluding).is_some()),
            ResourceKey::Article(_) => self
                .overlapping(window)
                .filter(|c| Some(c.reservation_id) != excluding)
                .fold(0u32, |sum, c| sum.saturating_add(c.units)),
        }
    }

    /// The earliest-starting other reservation overlapping `window`.
    pub fn first_conflict(&self, window: &Span, excluding: Option<Ulid>) -> Option<Ulid> {
        self.overlapping(window)
            .find(|c| Some(c.reservation_id) != excluding)
            .map(|c| c.reservation_id)
    }

    /// Units in use at instant `t`.
    pub fn units_at(&self, t: Ms) -> u32 {
        self.commitments
            .iter()
            .filter(|c| c.span.contains_instant(t))
            .map(|c| c.units)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn row(start: Ms, end: Ms, units: u32, source: CommitmentSource) -> Commitment {
        Commitment {
            reservation_id: Ulid::new(),
            span: Span::new(start, end),
            units,
            source,
        }
    }

    fn article_ledger(rows: &[Commitment]) -> LedgerState {
        let mut ledger = LedgerState::new(ResourceKey::Article(1));
        for r in rows {
            ledger.insert(*r);
        }
        ledger
    }

    #[test]
    fn insert_keeps_start_order() {
        let ledger = article_ledger(&[
            row(300, 400, 1, CommitmentSource::Direct),
            row(100, 200, 1, CommitmentSource::Direct),
            row(200, 300, 1, CommitmentSource::Attached),
        ]);
        let starts: Vec<Ms> = ledger.commitments.iter().map(|c| c.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn room_committed_is_zero_or_one() {
        let mut ledger = LedgerState::new(ResourceKey::Room(1));
        ledger.insert(row(10 * H, 11 * H, 1, CommitmentSource::Room));
        ledger.insert(row(10 * H + 30 * M, 12 * H, 1, CommitmentSource::Room));

        assert_eq!(ledger.committed(&Span::new(10 * H, 12 * H), None), 1);
        assert_eq!(ledger.committed(&Span::new(12 * H, 13 * H), None), 0);
        // Touching the end of a booking is not an overlap.
        assert_eq!(ledger.committed(&Span::new(9 * H, 10 * H), None), 0);
    }

    #[test]
    fn article_committed_sums_both_shapes() {
        let direct = row(9 * H, 10 * H, 2, CommitmentSource::Direct);
        let attached = row(9 * H + 15 * M, 9 * H + 45 * M, 3, CommitmentSource::Attached);
        let later = row(11 * H, 12 * H, 5, CommitmentSource::Direct);
        let ledger = article_ledger(&[direct, attached, later]);

        let window = Span::new(9 * H + 30 * M, 9 * H + 45 * M);
        assert_eq!(ledger.committed(&window, None), 5);
        assert_eq!(ledger.committed(&window, Some(attached.reservation_id)), 2);
        assert_eq!(ledger.committed(&window, Some(direct.reservation_id)), 3);
        assert_eq!(ledger.committed(&Span::new(10 * H, 11 * H), None), 0);
    }

    #[test]
    fn exclusion_removes_exactly_own_row() {
        let own = row(0, 100, 4, CommitmentSource::Direct);
        let other = row(50, 150, 1, CommitmentSource::Direct);
        let ledger = article_ledger(&[own, other]);
        let total = ledger.committed(&Span::new(0, 200), None);
        let without = ledger.committed(&Span::new(0, 200), Some(own.reservation_id));
        assert_eq!(total - without, own.units);
    }

    #[test]
    fn first_conflict_skips_excluded() {
        let mut ledger = LedgerState::new(ResourceKey::Room(3));
        let a = row(0, 100, 1, CommitmentSource::Room);
        ledger.insert(a);
        assert_eq!(ledger.first_conflict(&Span::new(50, 60), None), Some(a.reservation_id));
        assert_eq!(ledger.first_conflict(&Span::new(50, 60), Some(a.reservation_id)), None);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let ledger = article_ledger(&[
            row(100, 200, 1, CommitmentSource::Direct),
            row(450, 600, 1, CommitmentSource::Direct),
            row(1000, 1100, 1, CommitmentSource::Direct),
        ]);
        let hits: Vec<_> = ledger.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_large_commitment_spanning_query() {
        let ledger = article_ledger(&[row(0, 10_000, 1, CommitmentSource::Direct)]);
        assert_eq!(ledger.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn remove_and_get() {
        let a = row(0, 10, 1, CommitmentSource::Direct);
        let mut ledger = article_ledger(&[a]);
        assert_eq!(ledger.get(a.reservation_id), Some(&a));
        assert_eq!(ledger.remove(a.reservation_id), Some(a));
        assert!(ledger.remove(a.reservation_id).is_none());
        assert!(ledger.commitments.is_empty());
    }

    #[test]
    fn units_at_counts_instantaneous_use() {
        let ledger = article_ledger(&[
            row(0, 100, 2, CommitmentSource::Direct),
            row(50, 150, 1, CommitmentSource::Attached),
        ]);
        assert_eq!(ledger.units_at(0), 2);
        assert_eq!(ledger.units_at(75), 3);
        assert_eq!(ledger.units_at(100), 1);
        assert_eq!(ledger.units_at(150), 0);
    }
}

use crate::common::Result;
use crate::server::store::SqliteStore;
use serde::Serialize;
use tally::{ChildKind, CounterKey, CounterStore, SequenceNumber};

/// Allocated numbers under one counter that have no row.
///
/// Numbers still owned by in-flight tasks show up here too; drain the pool
/// before treating a report as final.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SequenceGap {
    pub parent_id: i64,
    pub kind: ChildKind,
    /// Highest number the allocator has handed out.
    pub high_water_mark: SequenceNumber,
    /// Highest number with a row, `0` if none.
    pub max_persisted: SequenceNumber,
    /// Exact count of numbers in `1..=high_water_mark` without a row.
    pub missing_count: u64,
    /// The first missing numbers, capped by the caller.
    pub missing: Vec<SequenceNumber>,
    /// How many missing numbers belong to dead-lettered tasks.
    pub dead_lettered: u64,
}

/// Missing numbers in `1..=high_water_mark`, given the ascending `persisted`
/// numbers. Returns the exact count and at most `cap` of the numbers.
pub fn missing_numbers(
    high_water_mark: SequenceNumber,
    persisted: &[SequenceNumber],
    cap: usize,
) -> (u64, Vec<SequenceNumber>) {
    let mut count = 0_u64;
    let mut missing = Vec::new();
    let mut expected: SequenceNumber = 1;

    let bounded = persisted
        .iter()
        .copied()
        .filter(|&n| n >= 1 && n <= high_water_mark);
    for n in bounded.chain(core::iter::once(high_water_mark + 1)) {
        if n > expected {
            count += n.abs_diff(expected);
            missing.extend((expected..n).take(cap.saturating_sub(missing.len())));
        }
        expected = expected.max(n + 1);
    }

    (count, missing)
}

/// Compares every counter in `counters` with the durable store.
///
/// Counters without a gap are omitted.
pub async fn gap_report<C>(
    store: &SqliteStore,
    counters: &C,
    max_missing: usize,
) -> Result<Vec<SequenceGap>>
where
    C: CounterStore + ?Sized,
{
    let mut gaps = Vec::new();

    for (key, high_water_mark) in counters.snapshot().await? {
        let CounterKey { parent_id, kind } = key;
        let persisted = store.persisted_numbers(key).await?;
        let (missing_count, missing) = missing_numbers(high_water_mark, &persisted, max_missing);
        if missing_count == 0 {
            continue;
        }

        let dead_lettered = store
            .dead_numbers(parent_id, kind)
            .await?
            .into_iter()
            .filter(|n| *n <= high_water_mark && persisted.binary_search(n).is_err())
            .count() as u64;

        gaps.push(SequenceGap {
            parent_id,
            kind,
            high_water_mark,
            max_persisted: persisted.last().copied().unwrap_or(0),
            missing_count,
            missing,
            dead_lettered,
        });
    }

    Ok(gaps)
}

//! Batch sizing for entity and collection batch fetching.

use graphload_core::{Error, Identifier, Result};
use graphload_session::BatchFetchStyle;

/// Descending statement sizes for a maximum batch size.
///
/// Sizes step down by halves while the half stays above ten, then by one:
/// `16` yields `[16, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1]`.
pub fn legacy_batch_sizes(max: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut n = max.max(1);
    while n > 1 {
        sizes.push(n);
        n = if n <= 10 {
            n - 1
        } else if n / 2 < 10 {
            10
        } else {
            n / 2
        };
    }
    sizes.push(1);
    sizes
}

/// Statement sizes available for `style`.
pub fn batch_sizes(max: usize, style: BatchFetchStyle) -> Result<Vec<usize>> {
    match style {
        BatchFetchStyle::Legacy | BatchFetchStyle::Padded => Ok(legacy_batch_sizes(max)),
        BatchFetchStyle::Dynamic => Err(Error::unsupported(
            "dynamic batch fetching",
            "batch fetch style 'dynamic' is not supported",
        )),
    }
}

/// Keys bound to one statement; `keys.len() == size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBatch {
    pub size: usize,
    pub keys: Vec<Identifier>,
}

fn take_batch(
    keys: &mut Vec<Identifier>,
    sizes: &[usize],
    style: BatchFetchStyle,
) -> Option<KeyBatch> {
    if keys.is_empty() {
        return None;
    }
    let count = keys.len();
    let size = match style {
        BatchFetchStyle::Padded => sizes
            .iter()
            .rev()
            .copied()
            .find(|s| *s >= count)
            .unwrap_or(sizes[0]),
        _ => sizes.iter().copied().find(|s| *s <= count).unwrap_or(1),
    };
    let mut batch: Vec<Identifier> = keys.drain(..size.min(count)).collect();
    if let Some(last) = batch.last().cloned() {
        batch.resize(size, last);
    }
    Some(KeyBatch { size, keys: batch })
}

/// The statement that loads `keys[0]`, together with as many of the
/// following keys as fit.
///
/// Legacy sizing loads the largest prefix matching a ladder size; padded
/// sizing loads everything up to the maximum and repeats the last key to
/// fill the statement.
pub fn first_batch(
    mut keys: Vec<Identifier>,
    max: usize,
    style: BatchFetchStyle,
) -> Result<KeyBatch> {
    let sizes = batch_sizes(max, style)?;
    take_batch(&mut keys, &sizes, style).ok_or_else(|| {
        Error::plan(
            graphload_core::PlanErrorKind::InvalidArgument,
            "no keys to load",
        )
    })
}

/// Split `keys` into statements covering all of them.
pub fn split_batches(
    mut keys: Vec<Identifier>,
    max: usize,
    style: BatchFetchStyle,
) -> Result<Vec<KeyBatch>> {
    let sizes = batch_sizes(max, style)?;
    let mut batches = Vec::new();
    while let Some(batch) = take_batch(&mut keys, &sizes, style) {
        batches.push(batch);
    }
    Ok(batches)
}

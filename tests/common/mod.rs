//! Shared helpers for the integration suite.
#![allow(dead_code)]

use dartboost::exec::PartitionedDataset;
use dartboost::RawInstance;

/// y = 2x + 3 over x = 0..n.
pub fn linear_rows(n: usize) -> Vec<RawInstance> {
    (0..n)
        .map(|i| RawInstance::labeled(2.0 * i as f64 + 3.0, vec![i as f64]))
        .collect()
}

/// XOR over {0,1}^2, replicated to `copies` rows per corner.
pub fn xor_rows(copies: usize) -> Vec<RawInstance> {
    let mut rows = Vec::with_capacity(copies * 4);
    for _ in 0..copies {
        for (a, b) in [(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0)] {
            let label = if (a != 0.0) ^ (b != 0.0) { 1.0 } else { 0.0 };
            rows.push(RawInstance::labeled(label, vec![a, b]));
        }
    }
    rows
}

pub fn partitioned(rows: Vec<RawInstance>, n_parts: usize) -> PartitionedDataset<RawInstance> {
    PartitionedDataset::from_rows(rows, n_parts)
}

/// Mean squared error of model predictions over a raw row set.
pub fn train_mse(model: &dartboost::GbmModel, rows: &[RawInstance]) -> f64 {
    let mut sse = 0.0;
    for row in rows {
        let p = model.predict(&row.features, None).unwrap()[0];
        let d = p - row.label[0];
        sse += d * d;
    }
    sse / rows.len() as f64
}

//! Logical model schema: four tables serialized with serde.
//!
//! - *discretizer*: per-column summary records
//! - *weights*: (tree_index, weight)
//! - *trees*: (tree_index, flat node list with level-order ids)
//! - *extra*: string KV carrying `base_score` and friends
//!
//! Loading verifies that tree indices form a contiguous unique cover of
//! `[0, n)`, that weights match trees one-to-one, and that every child link
//! resolves.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::discretizer::{ColumnKind, ColumnSummary, Discretizer};
use crate::error::PersistError;
use crate::model::GbmModel;
use crate::tree::Tree;

// ============================================================================
// Records
// ============================================================================

/// One discretizer column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnRecord {
    Quantile {
        thresholds: Vec<f64>,
        num_bins: u32,
        sparsity: f64,
    },
    Width {
        min: f64,
        max: f64,
        num_bins: u32,
        sparsity: f64,
    },
    Categorical {
        categories: Vec<(i64, u32)>,
        catch_all: Option<u32>,
        num_bins: u32,
        sparsity: f64,
    },
    Rank {
        categories: Vec<(i64, u32)>,
        catch_all: Option<u32>,
        num_bins: u32,
        sparsity: f64,
    },
}

/// One ensemble weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightRecord {
    pub tree_index: u32,
    pub weight: f64,
}

/// One tree node, keyed by level-order id (root = 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u32,
    pub is_leaf: bool,
    #[serde(default)]
    pub feature: u32,
    /// Numeric threshold bin; `None` for categorical splits and leaves.
    #[serde(default)]
    pub threshold: Option<u32>,
    /// Categorical left-set; `None` for numeric splits and leaves.
    #[serde(default)]
    pub categories_left: Option<Vec<u32>>,
    #[serde(default)]
    pub gain: f64,
    #[serde(default)]
    pub left_id: Option<u32>,
    #[serde(default)]
    pub right_id: Option<u32>,
    #[serde(default)]
    pub default_left: bool,
    #[serde(default)]
    pub leaf_value: f64,
}

/// One tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeRecord {
    pub tree_index: u32,
    pub nodes: Vec<NodeRecord>,
}

/// The full persisted model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTables {
    pub discretizer: Vec<ColumnRecord>,
    pub weights: Vec<WeightRecord>,
    pub trees: Vec<TreeRecord>,
    pub extra: Vec<(String, String)>,
}

// ============================================================================
// Model -> tables
// ============================================================================

impl GbmModel {
    pub fn to_tables(&self) -> ModelTables {
        let disc = self.discretizer();
        let discretizer = disc
            .columns()
            .iter()
            .zip(disc.sparsity())
            .map(|(col, &sparsity)| match col {
                ColumnSummary::NumericQuantile { thresholds } => ColumnRecord::Quantile {
                    thresholds: thresholds.clone(),
                    num_bins: col.num_bins(),
                    sparsity,
                },
                ColumnSummary::NumericWidth { min, max, n_bins } => ColumnRecord::Width {
                    min: *min,
                    max: *max,
                    num_bins: n_bins + 1,
                    sparsity,
                },
                ColumnSummary::Categorical { mapping, catch_all } => ColumnRecord::Categorical {
                    categories: mapping.iter().map(|(&k, &v)| (k, v)).collect(),
                    catch_all: *catch_all,
                    num_bins: col.num_bins(),
                    sparsity,
                },
                ColumnSummary::Rank { codes, catch_all } => ColumnRecord::Rank {
                    categories: codes.iter().map(|(&k, &v)| (k, v)).collect(),
                    catch_all: *catch_all,
                    num_bins: col.num_bins(),
                    sparsity,
                },
            })
            .collect();

        let weights = self
            .weights()
            .iter()
            .enumerate()
            .map(|(i, &weight)| WeightRecord {
                tree_index: i as u32,
                weight,
            })
            .collect();

        let trees = self
            .trees()
            .iter()
            .enumerate()
            .map(|(i, tree)| TreeRecord {
                tree_index: i as u32,
                nodes: tree_to_nodes(tree),
            })
            .collect();

        let base_score =
            serde_json::to_string(self.base_score()).expect("base score serializes");
        let extra = vec![
            ("base_score".to_string(), base_score),
            ("raw_size".to_string(), self.raw_size().to_string()),
            (
                "zero_as_missing".to_string(),
                self.discretizer().zero_as_missing().to_string(),
            ),
        ];

        ModelTables {
            discretizer,
            weights,
            trees,
            extra,
        }
    }

    /// Serialize to JSON.
    pub fn save_json<W: Write>(&self, writer: W) -> Result<(), PersistError> {
        serde_json::to_writer(writer, &self.to_tables())?;
        Ok(())
    }

    /// Deserialize and validate from JSON.
    pub fn load_json<R: Read>(reader: R) -> Result<Self, PersistError> {
        let tables: ModelTables = serde_json::from_reader(reader)?;
        GbmModel::from_tables(&tables)
    }
}

fn tree_to_nodes(tree: &Tree) -> Vec<NodeRecord> {
    (0..tree.n_nodes() as u32)
        .map(|slot| {
            let is_leaf = tree.is_leaf(slot);
            let cats = tree.categories_left(slot);
            NodeRecord {
                id: tree.level_order_id(slot),
                is_leaf,
                feature: if is_leaf { 0 } else { tree.split_feature(slot) },
                threshold: (!is_leaf && cats.is_empty())
                    .then(|| tree.numeric_threshold(slot)),
                categories_left: (!is_leaf && !cats.is_empty()).then(|| cats.to_vec()),
                gain: tree.split_gain(slot),
                left_id: (!is_leaf).then(|| tree.level_order_id(tree.left_child(slot))),
                right_id: (!is_leaf).then(|| tree.level_order_id(tree.right_child(slot))),
                default_left: tree.default_left(slot),
                leaf_value: if is_leaf { tree.leaf_value(slot) } else { 0.0 },
            }
        })
        .collect()
}

// ============================================================================
// Tables -> model
// ============================================================================

impl GbmModel {
    pub fn from_tables(tables: &ModelTables) -> Result<Self, PersistError> {
        let n = tables.trees.len();
        if tables.weights.len() != n {
            return Err(PersistError::WeightCountMismatch {
                trees: n,
                weights: tables.weights.len(),
            });
        }

        // Tree and weight indices must each cover [0, n) exactly once.
        let mut weights = vec![f64::NAN; n];
        for w in &tables.weights {
            let i = w.tree_index as usize;
            if i >= n || !weights[i].is_nan() {
                return Err(PersistError::TreeIndexGap {
                    n,
                    detail: format!("weight tree_index {}", w.tree_index),
                });
            }
            weights[i] = w.weight;
        }

        let mut trees: Vec<Option<Tree>> = vec![None; n];
        for record in &tables.trees {
            let i = record.tree_index as usize;
            if i >= n || trees[i].is_some() {
                return Err(PersistError::TreeIndexGap {
                    n,
                    detail: format!("tree_index {}", record.tree_index),
                });
            }
            trees[i] = Some(nodes_to_tree(record)?);
        }
        let trees: Vec<Tree> = trees.into_iter().map(|t| t.unwrap()).collect();

        let extra: BTreeMap<&str, &str> = tables
            .extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let base_score: Vec<f64> = serde_json::from_str(
            extra
                .get("base_score")
                .ok_or(PersistError::MissingExtra("base_score"))?,
        )?;
        let zero_as_missing = extra
            .get("zero_as_missing")
            .map(|v| *v == "true")
            .unwrap_or(false);

        let discretizer = tables_to_discretizer(&tables.discretizer, zero_as_missing);
        Ok(GbmModel::new(trees, weights, base_score, discretizer))
    }
}

fn tables_to_discretizer(records: &[ColumnRecord], zero_as_missing: bool) -> Discretizer {
    let mut columns = Vec::with_capacity(records.len());
    let mut kinds = Vec::with_capacity(records.len());
    let mut sparsity = Vec::with_capacity(records.len());
    for record in records {
        match record {
            ColumnRecord::Quantile {
                thresholds,
                sparsity: s,
                ..
            } => {
                columns.push(ColumnSummary::NumericQuantile {
                    thresholds: thresholds.clone(),
                });
                kinds.push(ColumnKind::Numeric);
                sparsity.push(*s);
            }
            ColumnRecord::Width {
                min,
                max,
                num_bins,
                sparsity: s,
            } => {
                columns.push(ColumnSummary::NumericWidth {
                    min: *min,
                    max: *max,
                    n_bins: num_bins.saturating_sub(1),
                });
                kinds.push(ColumnKind::Numeric);
                sparsity.push(*s);
            }
            ColumnRecord::Categorical {
                categories,
                catch_all,
                sparsity: s,
                ..
            } => {
                columns.push(ColumnSummary::Categorical {
                    mapping: categories.iter().copied().collect(),
                    catch_all: *catch_all,
                });
                kinds.push(ColumnKind::Categorical);
                sparsity.push(*s);
            }
            ColumnRecord::Rank {
                categories,
                catch_all,
                sparsity: s,
                ..
            } => {
                columns.push(ColumnSummary::Rank {
                    codes: categories.iter().copied().collect(),
                    catch_all: *catch_all,
                });
                kinds.push(ColumnKind::Rank);
                sparsity.push(*s);
            }
        }
    }
    Discretizer::from_parts(columns, kinds, sparsity, zero_as_missing)
}

fn nodes_to_tree(record: &TreeRecord) -> Result<Tree, PersistError> {
    // Ascending level-order id equals slot order.
    let mut sorted: Vec<&NodeRecord> = record.nodes.iter().collect();
    sorted.sort_by_key(|node| node.id);

    let slot_of: BTreeMap<u32, u32> = sorted
        .iter()
        .enumerate()
        .map(|(slot, node)| (node.id, slot as u32))
        .collect();

    let resolve = |node: &NodeRecord, child: Option<u32>| -> Result<u32, PersistError> {
        let child = child.ok_or(PersistError::DanglingChild {
            tree_index: record.tree_index,
            node: node.id,
            child: 0,
        })?;
        slot_of
            .get(&child)
            .copied()
            .ok_or(PersistError::DanglingChild {
                tree_index: record.tree_index,
                node: node.id,
                child,
            })
    };

    let n = sorted.len();
    let mut ids = Vec::with_capacity(n);
    let mut is_leaf = Vec::with_capacity(n);
    let mut feature = Vec::with_capacity(n);
    let mut threshold = Vec::with_capacity(n);
    let mut default_left = Vec::with_capacity(n);
    let mut gain = Vec::with_capacity(n);
    let mut left = Vec::with_capacity(n);
    let mut right = Vec::with_capacity(n);
    let mut leaf_value = Vec::with_capacity(n);
    let mut cat_offsets = vec![0u32];
    let mut cat_values = Vec::new();

    for &node in &sorted {
        ids.push(node.id);
        is_leaf.push(node.is_leaf);
        feature.push(node.feature);
        default_left.push(node.default_left);
        gain.push(node.gain);
        leaf_value.push(node.leaf_value);
        if node.is_leaf {
            threshold.push(0);
            left.push(crate::tree::NO_CHILD);
            right.push(crate::tree::NO_CHILD);
        } else {
            threshold.push(node.threshold.unwrap_or(0));
            if let Some(cats) = &node.categories_left {
                cat_values.extend_from_slice(cats);
            }
            left.push(resolve(node, node.left_id)?);
            right.push(resolve(node, node.right_id)?);
        }
        cat_offsets.push(cat_values.len() as u32);
    }

    Ok(Tree::from_parts(
        ids,
        is_leaf,
        feature,
        threshold,
        default_left,
        gain,
        left,
        right,
        leaf_value,
        cat_offsets,
        cat_values,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostConfig;
    use crate::data::RawInstance;
    use crate::discretizer::ColumnSchema;
    use crate::exec::PartitionedDataset;
    use crate::split::{SplitInfo, SplitKind};
    use crate::tree::MutableTree;

    fn sample_model() -> GbmModel {
        let rows: Vec<RawInstance> = (0..8)
            .map(|i| RawInstance::labeled(0.0, vec![i as f64, (i % 3) as f64]))
            .collect();
        let data = PartitionedDataset::from_rows(rows, 2);
        let schema = ColumnSchema::with_categorical(2, &[1]);
        let disc =
            Discretizer::fit(&data, &schema, &BoostConfig::default()).unwrap();

        let mut t0 = MutableTree::new(0.0, 8.0);
        let (l, r) = t0.split_node(
            0,
            SplitInfo {
                feature: 0,
                kind: SplitKind::Numeric { threshold: 3 },
                default_left: false,
                gain: 1.5,
                left: (-2.0, 4.0),
                right: (2.0, 4.0),
                position: 0,
            },
        );
        t0.set_leaf_value(l, -0.7);
        t0.set_leaf_value(r, 0.7);

        let mut t1 = MutableTree::new(0.0, 8.0);
        let (l, r) = t1.split_node(
            0,
            SplitInfo {
                feature: 1,
                kind: SplitKind::Categorical { left: vec![1, 3] },
                default_left: true,
                gain: 0.5,
                left: (-1.0, 4.0),
                right: (1.0, 4.0),
                position: 0,
            },
        );
        t1.set_leaf_value(l, 0.3);
        t1.set_leaf_value(r, -0.3);

        GbmModel::new(
            vec![t0.freeze(), t1.freeze()],
            vec![0.1, 0.1],
            vec![0.25],
            disc,
        )
    }

    #[test]
    fn round_trip_preserves_predictions() {
        let model = sample_model();
        let mut buf = Vec::new();
        model.save_json(&mut buf).unwrap();
        let loaded = GbmModel::load_json(buf.as_slice()).unwrap();

        assert_eq!(loaded.n_trees(), model.n_trees());
        assert_eq!(loaded.weights(), model.weights());
        assert_eq!(loaded.base_score(), model.base_score());
        for i in 0..8 {
            let features = [i as f64, (i % 3) as f64];
            assert_eq!(
                model.predict(&features, None).unwrap(),
                loaded.predict(&features, None).unwrap()
            );
        }
    }

    #[test]
    fn round_trip_is_exact_on_tables() {
        let model = sample_model();
        let tables = model.to_tables();
        let loaded = GbmModel::from_tables(&tables).unwrap();
        assert_eq!(&loaded, &model);
    }

    #[test]
    fn load_rejects_weight_count_mismatch() {
        let mut tables = sample_model().to_tables();
        tables.weights.pop();
        assert!(matches!(
            GbmModel::from_tables(&tables),
            Err(PersistError::WeightCountMismatch { .. })
        ));
    }

    #[test]
    fn load_rejects_duplicate_tree_index() {
        let mut tables = sample_model().to_tables();
        tables.trees[1].tree_index = 0;
        assert!(matches!(
            GbmModel::from_tables(&tables),
            Err(PersistError::TreeIndexGap { .. })
        ));
    }

    #[test]
    fn load_rejects_dangling_child() {
        let mut tables = sample_model().to_tables();
        tables.trees[0].nodes[0].left_id = Some(99);
        assert!(matches!(
            GbmModel::from_tables(&tables),
            Err(PersistError::DanglingChild { .. })
        ));
    }

    #[test]
    fn load_requires_base_score() {
        let mut tables = sample_model().to_tables();
        tables.extra.retain(|(k, _)| k != "base_score");
        assert!(matches!(
            GbmModel::from_tables(&tables),
            Err(PersistError::MissingExtra("base_score"))
        ));
    }

    #[test]
    fn node_ids_are_level_order() {
        let tables = sample_model().to_tables();
        let ids: Vec<u32> = tables.trees[0].nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(tables.trees[0].nodes[0].left_id, Some(2));
        assert_eq!(tables.trees[0].nodes[0].right_id, Some(3));
    }
}

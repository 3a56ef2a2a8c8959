//! JSONL vector import.
//!
//! Each line is one item: `{"item_id": 12, "vector": [...], "vector_3d": [x, y, z]}`.
//! `vector` is the clustering input; `vector_3d` is stored for the renderer
//! only. Items without a clustering vector are skipped, as are vectors with
//! non-finite values or a length other than the first imported vector's.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use tree_storage::Storage;
use tree_types::ItemId;

#[derive(Debug, Deserialize)]
struct ImportRecord {
    item_id: ItemId,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    vector_3d: Option<[f32; 3]>,
}

/// Counts from one import.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: u64,
    pub with_3d: u64,
    pub skipped: u64,
    pub malformed: u64,
}

/// Read `path` and store every usable vector.
pub fn import_vectors(storage: &Storage, path: &Path) -> Result<ImportStats> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let mut stats = ImportStats::default();
    let mut dim: Option<usize> = None;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: ImportRecord = serde_json::from_str(line)
            .with_context(|| format!("Invalid record on line {}", index + 1))?;

        let Some(vector) = record.vector.filter(|v| !v.is_empty()) else {
            debug!(item_id = record.item_id, "No clustering vector, skipping");
            stats.skipped += 1;
            continue;
        };

        if vector.iter().any(|v| !v.is_finite()) || dim.is_some_and(|d| d != vector.len()) {
            warn!(
                item_id = record.item_id,
                len = vector.len(),
                expected = dim,
                "Malformed vector, skipping"
            );
            stats.malformed += 1;
            continue;
        }
        dim.get_or_insert(vector.len());

        storage.put_vector(record.item_id, &vector)?;
        if let Some(vector_3d) = record.vector_3d {
            storage.put_vector_3d(record.item_id, &vector_3d)?;
            stats.with_3d += 1;
        }
        stats.imported += 1;
    }

    info!(
        imported = stats.imported,
        skipped = stats.skipped,
        malformed = stats.malformed,
        "Imported vectors"
    );
    Ok(stats)
}

use geosieve_common::SourceGeometry;
use sha2::{Digest, Sha256};

/// Content hash of a filter step's source geometry.
///
/// Literal sources hash their WKT (whitespace-normalized) and SRID. Dataset
/// sources hash the dataset id, its filter and the caller-maintained
/// revision, which changes whenever those features are edited.
pub fn source_hash(source: &SourceGeometry) -> String {
    let mut hasher = Sha256::new();
    match source {
        SourceGeometry::Literal { wkts, srid } => {
            hasher.update(b"literal\0");
            hasher.update(srid.unwrap_or(0).to_le_bytes());
            for wkt in wkts {
                hasher.update(normalize(wkt).as_bytes());
                hasher.update(b"\0");
            }
        }
        SourceGeometry::Dataset {
            dataset_id,
            filter,
            revision,
        } => {
            hasher.update(b"dataset\0");
            hasher.update(dataset_id.as_bytes());
            hasher.update(b"\0");
            hasher.update(filter.as_deref().unwrap_or("").trim().as_bytes());
            hasher.update(b"\0");
            hasher.update(revision.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

fn normalize(wkt: &str) -> String {
    wkt.split_whitespace().collect::<Vec<_>>().join(" ")
}

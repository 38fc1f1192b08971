//! Reads a set of layer files the way a validation session would and prints
//! the admin hierarchy they describe.
//!
//! Usage: inspect_layers <id_field> <parent_id_field> [level=]<path>...
//! Without an explicit `level=`, files are assigned levels in argument order.

use std::env;
use std::str::FromStr;

use georepo_core::domains::layer::{
    GeoJsonFeatureReader, IdFieldMapping, LayerFile, LayerHierarchyCache, LayerType,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    georepo_core::init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("usage: inspect_layers <id_field> <parent_id_field> [level=]<path>...");
        std::process::exit(2);
    }
    let id_field = &args[0];
    let parent_field = &args[1];

    let mut layers = Vec::new();
    for (index, arg) in args[2..].iter().enumerate() {
        let (level, path) = match arg.split_once('=') {
            Some((level, path)) => (i64::from_str(level)?, path.to_string()),
            None => (index as i64, arg.clone()),
        };
        layers.push(LayerFile {
            id: index as i64 + 1,
            session_id: 0,
            level,
            path,
            // zipped GeoJSON is detected from the extension
            layer_type: LayerType::Geojson,
            entity_type: None,
            id_fields: vec![IdFieldMapping { field: id_field.clone(), id_type: None, default: true }],
            name_fields: Vec::new(),
            // level 0 has no parent
            parent_id_field: if level > 0 { Some(parent_field.clone()) } else { None },
            boundary_type: None,
            privacy_level: None,
            privacy_level_field: None,
        });
    }

    let reader = GeoJsonFeatureReader::new();
    let cache = LayerHierarchyCache::build(&layers, &reader)?;

    println!("Layer hierarchy");
    println!("===============");
    let levels: Vec<i64> = cache.levels().collect();
    for level in &levels {
        let total = cache.features_at_level(*level).count();
        let missing_code = cache.features_at_level(*level).filter(|f| f.code.is_none()).count();
        println!("level {}: {} features ({} without {})", level, total, missing_code, id_field);
    }

    if let Some(first) = levels.first() {
        let deepest = levels.last().copied().unwrap_or(*first);
        println!();
        for root in cache.features_at_level(*first) {
            let Some(code) = root.code.as_deref() else { continue };
            let children = cache.children_of(first + 1, code).len();
            let reaches = cache.has_descendant_at_level(*first, code, deepest);
            println!("{}: {} children at level {}, reaches level {}: {}", code, children, first + 1, deepest, reaches);
        }
    }

    Ok(())
}

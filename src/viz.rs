//! Choropleth data preparation
//!
//! Rendering is left to whatever consumes the GeoJSON; this only attaches
//! ratios to county features.

use crate::aggregate::GeoRatio;
use crate::error::{IngestError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

/// Copy of `counties` holding only features whose `id` matches a ratio's
/// FIPS key, each with the ratio under `properties[property]` and the label
/// under `properties.label`. Undefined ratios become `null`.
pub fn choropleth_geojson(counties: &Value, ratios: &[GeoRatio], property: &str) -> Result<Value> {
    let features = counties
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| IngestError::InvalidInput("GeoJSON has no 'features' array".to_string()))?;

    let by_fips: HashMap<&str, &GeoRatio> = ratios.iter().map(|r| (r.fips.as_str(), r)).collect();

    let matched: Vec<Value> = features
        .iter()
        .filter_map(|feature| {
            let id = match feature.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => format!("{:0>5}", n),
                _ => return None,
            };
            let ratio = by_fips.get(id.as_str())?;

            let mut feature = feature.clone();
            let object = feature.as_object_mut()?;
            let properties = object.entry("properties").or_insert_with(|| json!({}));
            if !properties.is_object() {
                *properties = json!({});
            }
            if let Some(props) = properties.as_object_mut() {
                props.insert(property.to_string(), json!(ratio.ratio.percent()));
                props.insert("label".to_string(), json!(ratio.label));
            }
            Some(feature)
        })
        .collect();

    debug!("Matched {} of {} features", matched.len(), features.len());

    let mut collection = counties.clone();
    if let Some(object) = collection.as_object_mut() {
        object.insert("features".to_string(), Value::Array(matched));
    }
    Ok(collection)
}

pub fn load_geojson(path: impl AsRef<std::path::Path>) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Ratio;

    #[test]
    fn test_attaches_ratios_to_matching_features() {
        let counties = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "id": "06073", "properties": {"NAME": "San Diego"}, "geometry": null},
                {"type": "Feature", "id": "06001", "geometry": null},
                {"type": "Feature", "id": "36061", "properties": {}, "geometry": null}
            ]
        });
        let ratios = vec![
            GeoRatio { fips: "06073".into(), label: "San Diego".into(), ratio: Ratio::Percent(42.0) },
            GeoRatio { fips: "06001".into(), label: "Alameda".into(), ratio: Ratio::Undefined },
        ];

        let out = choropleth_geojson(&counties, &ratios, "Percentage").unwrap();
        let features = out["features"].as_array().unwrap();

        assert_eq!(features.len(), 2);
        assert_eq!(out["type"], "FeatureCollection");
        assert_eq!(features[0]["properties"]["Percentage"], json!(42.0));
        assert_eq!(features[0]["properties"]["NAME"], "San Diego");
        assert_eq!(features[1]["properties"]["Percentage"], Value::Null);
        assert_eq!(features[1]["properties"]["label"], "Alameda");
    }

    #[test]
    fn test_requires_feature_collection() {
        assert!(choropleth_geojson(&json!({"type": "Feature"}), &[], "p").is_err());
    }
}

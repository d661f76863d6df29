//! schema.org `Dataset` descriptions

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{ExtractSettings, FileRecord};

/// Geographic extent in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Read the four limit attributes; all of them must be present
    pub fn from_attributes(attributes: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            south: number(attributes.get("southlimit")?)?,
            west: number(attributes.get("westlimit")?)?,
            north: number(attributes.get("northlimit")?)?,
            east: number(attributes.get("eastlimit")?)?,
        })
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            south: self.south.min(other.south),
            west: self.west.min(other.west),
            north: self.north.max(other.north),
            east: self.east.max(other.east),
        }
    }

    /// GeoShape box notation: "south west north east"
    pub fn to_box_string(&self) -> String {
        format!("{:.6} {:.6} {:.6} {:.6}", self.south, self.west, self.north, self.east)
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(super) struct DatasetInfo<'a> {
    pub resource_id: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub keywords: &'a [String],
}

pub(super) fn build_dataset(info: &DatasetInfo<'_>, files: &[FileRecord], settings: &ExtractSettings) -> Value {
    let resource_url = settings.resource_url(info.resource_id);
    let description = info.description.map(str::to_string).unwrap_or_else(|| {
        format!(
            "This publication {} is a resource in {} Portal.",
            info.name, settings.catalog_name
        )
    });

    let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
    let date_modified = files.iter().map(|f| f.mtime).max().unwrap_or_else(Utc::now);

    let coverage = files
        .iter()
        .filter_map(|f| f.attributes.as_ref().and_then(BoundingBox::from_attributes))
        .reduce(BoundingBox::union);

    let creator = &settings.creator;
    let profile_url = creator
        .url
        .clone()
        .unwrap_or_else(|| format!("{}/accounts/profile/", settings.site_url));

    let mut dataset = json!({
        "@context": "https://schema.org",
        "@type": "Dataset",
        "@id": resource_url,
        "url": resource_url,
        "sameAs": resource_url,
        "name": info.name,
        "description": description,
        "keywords": info.keywords,
        "creativeWorkStatus": "Published",
        "identifier": [{
            "@type": "PropertyValue",
            "@id": info.resource_id,
            "name": resource_url,
            "url": resource_url,
        }],
        "creator": {
            "@list": [{
                "@type": "Person",
                "name": creator.name,
                "email": creator.email,
                "url": profile_url,
                "affiliation": {
                    "@type": "Organization",
                    "name": creator.affiliation,
                },
            }]
        },
        "publisher": {
            "@type": "Organization",
            "name": settings.publisher,
        },
        "provider": {
            "@id": settings.site_url,
            "@type": "Organization",
            "name": format!("{} Portal", settings.catalog_name),
            "url": settings.site_url,
        },
        "includedInDataCatalog": {
            "@type": "DataCatalog",
            "name": settings.catalog_name,
            "url": settings.site_url,
        },
        "license": {
            "@type": "CreativeWork",
            "text": settings.license_text,
            "url": settings.license_url,
        },
        "isAccessibleForFree": true,
        "dateModified": date_modified.to_rfc3339(),
        "datePublished": Utc::now().to_rfc3339(),
        "distribution": {
            "@type": "DataDownload",
            "contentUrl": settings.download_url(info.resource_id),
            "contentSize": human_size(total_bytes),
            "encodingFormat": encoding_format(files),
            "identifier": [resource_url],
        },
    });

    if let (Some(bbox), Some(obj)) = (coverage, dataset.as_object_mut()) {
        obj.insert(
            "spatialCoverage".to_string(),
            json!({
                "@type": "Place",
                "geo": {
                    "@type": "GeoShape",
                    "box": bbox.to_box_string(),
                }
            }),
        );
    }

    dataset
}

fn encoding_format(files: &[FileRecord]) -> &'static str {
    match files {
        [single] => match single.extension.as_deref() {
            Some("tif" | "tiff") => "image/tiff",
            Some("csv") => "text/csv",
            Some("json" | "geojson") => "application/json",
            Some("zip") => "application/zip",
            Some("txt" | "md") => "text/plain",
            _ => "application/octet-stream",
        },
        _ => "application/zip",
    }
}

/// Decimal size with one fractional digit, e.g. "46.4 MB"
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

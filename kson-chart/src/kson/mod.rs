//! KSON JSON format support.
//!
//! The array representations are dense: single values collapse, defaults are
//! elided and graph points compress (see the element writers in `write`). The
//! reader accepts both compact and expanded forms.

mod read;
mod write;

pub use read::{load_chart, load_chart_from_path, load_chart_with_diag, load_meta};
pub use write::{save_chart, save_chart_to_path};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::diag::KsonLoadingDiag;
use crate::ChartData;

/// kson format version number (1 for kson 0.9.0).
pub const KSON_FORMAT_VERSION: i64 = 1;

pub fn chart_to_json_value(chart: &ChartData) -> serde_json::Value {
    write::chart_to_value(chart)
}

pub fn chart_from_json_value(value: &serde_json::Value) -> ChartData {
    let mut diag = KsonLoadingDiag::default();
    read::chart_from_value(value, &mut diag)
}

impl Serialize for ChartData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        write::chart_to_value(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChartData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let chart = chart_from_json_value(&value);
        if let Some(error) = chart.error {
            return Err(D::Error::custom(error));
        }
        Ok(chart)
    }
}

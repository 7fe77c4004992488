//! Camera attribute values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Attributes forwarded to the SDK as `PCO_Set<Name>` / `PCO_Get<Name>`, in
/// the order they are applied.
pub const SDK_ATTRIBUTES: [&str; 7] = [
    "SensorFormat",
    "Binning",
    "PixelRate",
    "IRSensitivity",
    "DelayExposureTime",
    "TriggerMode",
    "TimestampMode",
];

/// Software region of interest.
pub const ROI: &str = "ROI";
/// Mirror frames left-to-right.
pub const FLIPLR: &str = "fliplr";
/// Mirror frames top-to-bottom.
pub const FLIPUD: &str = "flipud";

/// Every settable attribute, SDK ones first.
pub fn attribute_names() -> Vec<&'static str> {
    SDK_ATTRIBUTES
        .iter()
        .copied()
        .chain([ROI, FLIPLR, FLIPUD])
        .collect()
}

/// Sub-rectangle of the post-binning frame.
///
/// Fields are signed so that negative values coming from configuration can be
/// reported rather than failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// First column.
    #[serde(rename = "offsetX")]
    pub offset_x: i64,
    /// First row.
    #[serde(rename = "offsetY")]
    pub offset_y: i64,
    /// Columns kept.
    pub width: i64,
    /// Rows kept.
    pub height: i64,
}

impl Roi {
    /// Full frame of `width` x `height`.
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            offset_x: 0,
            offset_y: 0,
            width: width as i64,
            height: height as i64,
        }
    }

    /// Fields by their attribute key.
    pub fn fields(&self) -> [(&'static str, i64); 4] {
        [
            ("offsetX", self.offset_x),
            ("offsetY", self.offset_y),
            ("width", self.width),
            ("height", self.height),
        ]
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{offsetX: {}, offsetY: {}, width: {}, height: {}}}",
            self.offset_x, self.offset_y, self.width, self.height
        )
    }
}

/// Value of one camera attribute.
///
/// Tuples are unpacked into the arguments of the SDK setter, e.g. `Binning`
/// takes `(horizontal, vertical)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Flag, e.g. `fliplr`.
    Bool(bool),
    /// Single integer argument.
    Int(i64),
    /// Single floating-point argument.
    Float(f64),
    /// Several integer arguments.
    Tuple(Vec<i64>),
    /// Region of interest.
    Roi(Roi),
}

impl AttributeValue {
    /// The value as SDK setter arguments.
    pub fn as_args(&self) -> Option<Vec<i64>> {
        match self {
            AttributeValue::Bool(b) => Some(vec![i64::from(*b)]),
            AttributeValue::Int(v) => Some(vec![*v]),
            AttributeValue::Tuple(v) => Some(v.clone()),
            AttributeValue::Float(_) | AttributeValue::Roi(_) => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Tuple(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
            AttributeValue::Roi(roi) => write!(f, "{}", roi),
        }
    }
}

impl From<Roi> for AttributeValue {
    fn from(roi: Roi) -> Self {
        AttributeValue::Roi(roi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_json_shapes() {
        let attrs: BTreeMap<String, AttributeValue> = serde_json::from_str(
            r#"{
                "Binning": [2, 2],
                "PixelRate": 24000000,
                "fliplr": true,
                "ROI": {"offsetX": 1, "offsetY": 2, "width": 30, "height": 40}
            }"#,
        )
        .unwrap();
        assert_eq!(attrs["Binning"], AttributeValue::Tuple(vec![2, 2]));
        assert_eq!(attrs["PixelRate"], AttributeValue::Int(24_000_000));
        assert_eq!(attrs["fliplr"], AttributeValue::Bool(true));
        assert_eq!(
            attrs["ROI"],
            AttributeValue::Roi(Roi {
                offset_x: 1,
                offset_y: 2,
                width: 30,
                height: 40
            })
        );
    }

    #[test]
    fn test_roi_missing_key_rejected() {
        let parsed: Result<AttributeValue, _> =
            serde_json::from_str(r#"{"offsetX": 1, "offsetY": 2, "width": 30}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(AttributeValue::Tuple(vec![0, 5, 0, 2]).to_string(), "(0, 5, 0, 2)");
        assert_eq!(AttributeValue::Int(1).to_string(), "1");
        assert_eq!(attribute_names().len(), 10);
    }
}

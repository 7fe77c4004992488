//! Shot files.
//!
//! A shot file carries, per device, the static value table compiled for the
//! shot, the camera exposure list and camera attributes, and receives the
//! images acquired during the shot. Workers only see the `ShotFile` trait;
//! two backends are provided here, one in memory for tests and tooling and
//! one backed by a JSON document on disk.

use crate::devices::pco::{AttributeValue, Frame};
use crate::error::{AppResult, DeviceError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Camera attribute name to value.
pub type CameraAttributes = BTreeMap<String, AttributeValue>;

/// One requested camera exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    /// Image group name, e.g. `"absorption"`.
    pub name: String,
    /// Frame type within the group, e.g. `"atoms"`.
    pub frametype: String,
    /// Trigger time within the shot in seconds.
    #[serde(default)]
    pub t: f64,
}

/// All frames acquired for one `(name, frametype)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedImage {
    /// Image group name.
    pub name: String,
    /// Frame type within the group.
    pub frametype: String,
    /// Pixel data, in acquisition order.
    pub frames: Vec<Frame>,
}

/// What a camera writes back after a shot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Device that took the images.
    pub camera: String,
    /// Fewer images arrived than exposures were requested.
    pub failed_shot: bool,
    /// Camera attributes in effect during the shot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<CameraAttributes>,
    /// Images grouped by exposure.
    pub images: Vec<SavedImage>,
}

impl ImageRecord {
    /// Number of frames across all groups.
    pub fn frame_count(&self) -> usize {
        self.images.iter().map(|image| image.frames.len()).sum()
    }
}

/// Everything a shot file holds for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceGroup {
    /// Static value table: connection name to value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_values: Option<BTreeMap<String, f64>>,
    /// Camera exposure list, in trigger order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exposures: Vec<Exposure>,
    /// Buffered-mode camera attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_attributes: Option<CameraAttributes>,
    /// Images written back after the shot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<ImageRecord>,
}

/// Read/write access to one shot.
pub trait ShotFile: Send + Sync {
    /// Static value table for `device`, if the shot has one.
    fn static_values(&self, device: &str) -> AppResult<Option<BTreeMap<String, f64>>>;

    /// Camera exposures for `device`. Empty when the camera is unused.
    fn camera_exposures(&self, device: &str) -> AppResult<Vec<Exposure>>;

    /// Buffered-mode camera attributes for `device`.
    fn camera_attributes(&self, device: &str) -> AppResult<Option<CameraAttributes>>;

    /// Store acquired images under `image_path`, usually the camera's
    /// orientation or device name.
    fn save_images(&self, image_path: &str, record: ImageRecord) -> AppResult<()>;
}

// =============================================================================
// MemoryShotFile
// =============================================================================

/// Shot held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryShotFile {
    devices: Mutex<BTreeMap<String, DeviceGroup>>,
}

impl MemoryShotFile {
    /// Empty shot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the static value table of `device`.
    pub fn with_static_values(self, device: &str, values: BTreeMap<String, f64>) -> Self {
        self.update(device, |group| group.static_values = Some(values));
        self
    }

    /// Set the exposure list of `device`.
    pub fn with_exposures(self, device: &str, exposures: Vec<Exposure>) -> Self {
        self.update(device, |group| group.exposures = exposures);
        self
    }

    /// Set the buffered camera attributes of `device`.
    pub fn with_camera_attributes(self, device: &str, attributes: CameraAttributes) -> Self {
        self.update(device, |group| group.camera_attributes = Some(attributes));
        self
    }

    /// Images saved under `image_path`, if any.
    pub fn saved_images(&self, image_path: &str) -> Option<ImageRecord> {
        self.lock()
            .get(image_path)
            .and_then(|group| group.images.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, DeviceGroup>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, device: &str, f: impl FnOnce(&mut DeviceGroup)) {
        let mut devices = self.lock();
        f(devices.entry(device.to_string()).or_default());
    }
}

impl ShotFile for MemoryShotFile {
    fn static_values(&self, device: &str) -> AppResult<Option<BTreeMap<String, f64>>> {
        Ok(self
            .lock()
            .get(device)
            .and_then(|group| group.static_values.clone()))
    }

    fn camera_exposures(&self, device: &str) -> AppResult<Vec<Exposure>> {
        Ok(self
            .lock()
            .get(device)
            .map(|group| group.exposures.clone())
            .unwrap_or_default())
    }

    fn camera_attributes(&self, device: &str) -> AppResult<Option<CameraAttributes>> {
        Ok(self
            .lock()
            .get(device)
            .and_then(|group| group.camera_attributes.clone()))
    }

    fn save_images(&self, image_path: &str, record: ImageRecord) -> AppResult<()> {
        self.update(image_path, |group| group.images = Some(record));
        Ok(())
    }
}

// =============================================================================
// JsonShotFile
// =============================================================================

/// On-disk layout of a JSON shot file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShotDocument {
    /// Creation time, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    /// Per-device groups keyed by device name.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceGroup>,
}

/// Shot stored as a JSON document.
///
/// The document is read once when opened; `save_images` rewrites the whole
/// file.
#[derive(Debug)]
pub struct JsonShotFile {
    path: PathBuf,
    document: Mutex<ShotDocument>,
}

impl JsonShotFile {
    /// Open an existing shot document.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let text = fs::read_to_string(&path).map_err(|e| {
            DeviceError::ShotFile(format!("Cannot read shot file '{}': {}", path.display(), e))
        })?;
        let document: ShotDocument = serde_json::from_str(&text)?;
        debug!(path = %path.display(), devices = document.devices.len(), "Opened shot file");
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    /// Write `document` to `path` and open it.
    pub fn create(path: impl AsRef<Path>, mut document: ShotDocument) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if document.created.is_none() {
            document.created = Some(chrono::Utc::now());
        }
        write_document(&path, &document)?;
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current document.
    pub fn document(&self) -> ShotDocument {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShotDocument> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_document(path: &Path, document: &ShotDocument) -> AppResult<()> {
    let text = serde_json::to_string_pretty(document)?;
    fs::write(path, text).map_err(|e| {
        DeviceError::ShotFile(format!("Cannot write shot file '{}': {}", path.display(), e))
    })
}

impl ShotFile for JsonShotFile {
    fn static_values(&self, device: &str) -> AppResult<Option<BTreeMap<String, f64>>> {
        Ok(self
            .lock()
            .devices
            .get(device)
            .and_then(|group| group.static_values.clone()))
    }

    fn camera_exposures(&self, device: &str) -> AppResult<Vec<Exposure>> {
        Ok(self
            .lock()
            .devices
            .get(device)
            .map(|group| group.exposures.clone())
            .unwrap_or_default())
    }

    fn camera_attributes(&self, device: &str) -> AppResult<Option<CameraAttributes>> {
        Ok(self
            .lock()
            .devices
            .get(device)
            .and_then(|group| group.camera_attributes.clone()))
    }

    fn save_images(&self, image_path: &str, record: ImageRecord) -> AppResult<()> {
        let mut document = self.lock();
        let count = record.frame_count();
        document
            .devices
            .entry(image_path.to_string())
            .or_default()
            .images = Some(record);
        write_document(&self.path, &document)?;
        info!(image_path, count, path = %self.path.display(), "Saved images to shot file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure(name: &str, frametype: &str) -> Exposure {
        Exposure {
            name: name.into(),
            frametype: frametype.into(),
            t: 0.1,
        }
    }

    #[test]
    fn test_memory_shot_file() {
        let shot = MemoryShotFile::new()
            .with_static_values("rotators", BTreeMap::from([("0".to_string(), 1000.0)]))
            .with_exposures("camera", vec![exposure("absorption", "atoms")]);

        assert_eq!(
            shot.static_values("rotators").unwrap().unwrap()["0"],
            1000.0
        );
        assert!(shot.static_values("camera").unwrap().is_none());
        assert_eq!(shot.camera_exposures("camera").unwrap().len(), 1);
        assert!(shot.camera_exposures("nobody").unwrap().is_empty());

        let frame = Frame::new(2, 1, vec![1, 2]).unwrap();
        shot.save_images(
            "camera",
            ImageRecord {
                camera: "camera".into(),
                images: vec![SavedImage {
                    name: "absorption".into(),
                    frametype: "atoms".into(),
                    frames: vec![frame],
                }],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(shot.saved_images("camera").unwrap().frame_count(), 1);
        assert!(shot.saved_images("rotators").is_none());
    }

    #[test]
    fn test_json_shot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.json");

        let mut document = ShotDocument::default();
        document.devices.insert(
            "synth".into(),
            DeviceGroup {
                static_values: Some(BTreeMap::from([
                    ("freq".to_string(), 2.5e9),
                    ("amp".to_string(), -3.0),
                    ("gate".to_string(), 1.0),
                ])),
                ..Default::default()
            },
        );
        let shot = JsonShotFile::create(&path, document).unwrap();
        shot.save_images(
            "camera",
            ImageRecord {
                camera: "camera".into(),
                failed_shot: true,
                attributes: None,
                images: vec![SavedImage {
                    name: "fluo".into(),
                    frametype: "bg".into(),
                    frames: vec![Frame::new(1, 1, vec![7]).unwrap()],
                }],
            },
        )
        .unwrap();

        let reopened = JsonShotFile::open(&path).unwrap();
        let values = reopened.static_values("synth").unwrap().unwrap();
        assert_eq!(values["freq"], 2.5e9);
        let document = reopened.document();
        assert!(document.created.is_some());
        let record = document.devices["camera"].images.clone().unwrap();
        assert!(record.failed_shot);
        assert_eq!(record.images[0].frames[0].data(), &[7]);
    }

    #[test]
    fn test_json_shot_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonShotFile::open(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, DeviceError::ShotFile(_)));
    }
}

//! End-to-end shot over every simulated device in the default configuration.
//!
//! Run with: cargo test --test mock_rig

use lab_devices::config::Settings;
use lab_devices::registry::build_all;
use lab_devices::shot::{DeviceGroup, Exposure, JsonShotFile, ShotDocument, ShotFile};
use lab_devices::worker::{ChannelValue, DdsValues};
use lab_devices::ChannelValues;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::NamedTempFile;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Default configuration with a small simulated sensor.
fn create_temp_settings_file() -> NamedTempFile {
    let content = DEFAULT_CONFIG.replace("width = 640, height = 480", "width = 16, height = 12");
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), content).unwrap();
    file
}

fn static_values(values: &[(&str, f64)]) -> DeviceGroup {
    DeviceGroup {
        static_values: Some(values.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
        ..Default::default()
    }
}

fn shot_document() -> ShotDocument {
    let mut document = ShotDocument::default();
    let devices = &mut document.devices;
    devices.insert("rotators".into(), static_values(&[("0", 1000.0), ("1", 2000.0)]));
    devices.insert(
        "microwave_synth".into(),
        static_values(&[("freq", 2.5e9), ("amp", -3.0), ("gate", 1.0)]),
    );
    devices.insert("imaging_stage".into(), static_values(&[("position", 2.5)]));
    devices.insert("mirror_actuators".into(), static_values(&[("device 1", 500.0)]));
    devices.insert(
        "absorption_camera".into(),
        DeviceGroup {
            exposures: vec![
                Exposure {
                    name: "absorption".into(),
                    frametype: "atoms".into(),
                    t: 0.1,
                },
                Exposure {
                    name: "absorption".into(),
                    frametype: "flat".into(),
                    t: 0.2,
                },
            ],
            ..Default::default()
        },
    );
    document
}

#[test]
fn test_default_config_loads() {
    let settings_file = create_temp_settings_file();
    let settings = Settings::load(settings_file.path()).unwrap();
    assert_eq!(settings.devices.len(), 5);
    assert!(settings.devices.iter().all(|d| d.mock));
    let camera = settings.device("absorption_camera").unwrap().pco_camera().unwrap();
    assert_eq!(camera.serial_number, 269);
    assert_eq!(camera.orientation.as_deref(), Some("side"));
}

#[tokio::test]
async fn test_full_shot_on_simulated_rig() {
    let settings_file = create_temp_settings_file();
    let settings = Settings::load(settings_file.path()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let shot_path = dir.path().join("shot.json");
    let shot: Arc<dyn ShotFile> = Arc::new(JsonShotFile::create(&shot_path, shot_document()).unwrap());

    let mut workers = build_all(&settings).unwrap();
    for worker in workers.iter_mut() {
        worker.init().await.unwrap();
    }

    let mut front_panel: BTreeMap<String, ChannelValues> = BTreeMap::new();
    for worker in workers.iter_mut() {
        let name = worker.name().to_string();
        let values = worker
            .transition_to_buffered(&name, Arc::clone(&shot), &ChannelValues::new(), true)
            .await
            .unwrap();
        front_panel.insert(name, values);
    }
    for worker in workers.iter_mut() {
        assert!(worker.transition_to_manual().await.unwrap(), "{}", worker.name());
    }
    for worker in workers.iter_mut() {
        worker.shutdown().await.unwrap();
    }

    assert_eq!(front_panel["rotators"]["0"], ChannelValue::Analog(1000.0));
    assert_eq!(front_panel["rotators"]["1"], ChannelValue::Analog(2000.0));
    assert_eq!(
        front_panel["microwave_synth"]["dds 0"],
        ChannelValue::Dds(DdsValues {
            freq: 2.5e9,
            amp: -3.0,
            gate: true
        })
    );
    assert_eq!(front_panel["imaging_stage"]["position"], ChannelValue::Analog(2.5));
    assert_eq!(front_panel["mirror_actuators"]["device 1"], ChannelValue::Analog(500.0));
    assert_eq!(front_panel["mirror_actuators"]["device 2"], ChannelValue::Analog(0.0));
    assert!(front_panel["absorption_camera"].is_empty());

    let document = JsonShotFile::open(&shot_path).unwrap().document();
    let record = document.devices["side"].images.clone().unwrap();
    assert_eq!(record.camera, "absorption_camera");
    assert!(!record.failed_shot);
    assert_eq!(record.frame_count(), 2);
    assert_eq!(record.images[0].frametype, "atoms");
    assert_eq!(record.images[0].frames[0].width(), 16);
}

//! Camera worker tests against the simulated PCO SDK.
//!
//! Run with: cargo test --test pco_camera_worker

use lab_devices::config::PcoCameraConfig;
use lab_devices::devices::pco::{AttributeValue, PcoCameraWorker, Roi};
use lab_devices::hardware::mock::{SimulatedPcoCamera, SimulatedPcoLibrary};
use lab_devices::shot::{CameraAttributes, Exposure, MemoryShotFile, ShotFile};
use lab_devices::{ChannelValues, DeviceError, DeviceWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const SERIAL: u32 = 269;

fn config() -> PcoCameraConfig {
    PcoCameraConfig {
        serial_number: SERIAL,
        orientation: None,
        camera_attributes: CameraAttributes::new(),
        manual_mode_camera_attributes: CameraAttributes::from([(
            "TriggerMode".to_string(),
            AttributeValue::Int(0),
        )]),
        stop_acquisition_timeout_secs: 0.3,
        exception_on_failed_shot: false,
        grab_timeout_ms: 50,
        abort_check_period_ms: 10,
        mock_sensor: None,
    }
}

async fn worker(config: PcoCameraConfig) -> (PcoCameraWorker, SimulatedPcoCamera) {
    let sim = SimulatedPcoCamera::new(SERIAL, 8, 6, 14);
    let library = SimulatedPcoLibrary::new(vec![sim.clone()]);
    let mut worker = PcoCameraWorker::new("camera", &config, Box::new(library));
    worker.init().await.unwrap();
    (worker, sim)
}

fn exposure(frametype: &str, t: f64) -> Exposure {
    Exposure {
        name: "absorption".to_string(),
        frametype: frametype.to_string(),
        t,
    }
}

fn shot(exposures: Vec<Exposure>, attributes: CameraAttributes) -> Arc<MemoryShotFile> {
    Arc::new(
        MemoryShotFile::new()
            .with_exposures("camera", exposures)
            .with_camera_attributes("camera", attributes),
    )
}

async fn arm(worker: &mut PcoCameraWorker, shot: &Arc<MemoryShotFile>) {
    let shot: Arc<dyn ShotFile> = shot.clone();
    worker
        .transition_to_buffered("camera", shot, &ChannelValues::new(), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_buffered_shot_saves_processed_frames() {
    let (mut worker, sim) = worker(config()).await;
    let attributes = CameraAttributes::from([
        ("TriggerMode".to_string(), AttributeValue::Int(2)),
        (
            "ROI".to_string(),
            AttributeValue::Roi(Roi {
                offset_x: 2,
                offset_y: 1,
                width: 4,
                height: 2,
            }),
        ),
        ("fliplr".to_string(), AttributeValue::Bool(true)),
    ]);
    let shot = shot(
        vec![exposure("flat", 0.2), exposure("atoms", 0.1), exposure("dark", 0.3)],
        attributes,
    );

    arm(&mut worker, &shot).await;
    assert_eq!(sim.setting("TriggerMode"), Some(AttributeValue::Int(2)));
    assert!(worker.transition_to_manual().await.unwrap());

    let record = shot.saved_images("camera").unwrap();
    assert!(!record.failed_shot);
    assert_eq!(record.camera, "camera");
    assert_eq!(record.frame_count(), 3);
    let frametypes: Vec<&str> = record.images.iter().map(|i| i.frametype.as_str()).collect();
    assert_eq!(frametypes, vec!["atoms", "flat", "dark"]);

    let frame = &record.images[0].frames[0];
    assert_eq!((frame.width(), frame.height()), (4, 2));
    assert_eq!(frame.data(), &[13, 12, 11, 10, 21, 20, 19, 18]);

    let saved = record.attributes.unwrap();
    assert_eq!(saved["fliplr"], AttributeValue::Bool(true));

    // Manual-mode attributes are back and the camera is idle
    assert_eq!(sim.setting("TriggerMode"), Some(AttributeValue::Int(0)));
    assert!(!sim.is_recording());
}

#[tokio::test]
async fn test_missing_triggers_mark_failed_shot() {
    let (mut worker, sim) = worker(config()).await;
    sim.set_trigger_budget(Some(1));
    let shot = shot(
        vec![exposure("atoms", 0.1), exposure("flat", 0.2)],
        CameraAttributes::new(),
    );

    arm(&mut worker, &shot).await;
    assert!(worker.transition_to_manual().await.unwrap());

    let record = shot.saved_images("camera").unwrap();
    assert!(record.failed_shot);
    assert_eq!(record.frame_count(), 0);
    assert!(!sim.is_recording());
}

#[tokio::test]
async fn test_missing_triggers_raise_when_configured() {
    let config = PcoCameraConfig {
        exception_on_failed_shot: true,
        ..config()
    };
    let (mut worker, sim) = worker(config).await;
    sim.set_trigger_budget(Some(0));
    let shot = shot(vec![exposure("atoms", 0.1)], CameraAttributes::new());

    arm(&mut worker, &shot).await;
    let err = worker.transition_to_manual().await.unwrap_err();
    assert!(matches!(err, DeviceError::Instrument(_)));
    assert!(err.to_string().contains("Acquisition thread did not finish"));
    assert!(shot.saved_images("camera").is_none());
    assert!(!sim.is_recording());
}

#[tokio::test]
async fn test_partial_frames_saved_when_readout_fails() {
    let (mut worker, sim) = worker(config()).await;
    let shot = shot(
        vec![exposure("flat", 0.2), exposure("atoms", 0.1), exposure("dark", 0.3)],
        CameraAttributes::new(),
    );
    sim.set_read_budget(Some(1));
    arm(&mut worker, &shot).await;
    assert!(worker.transition_to_manual().await.unwrap());

    let record = shot.saved_images("camera").unwrap();
    assert!(record.failed_shot);
    assert_eq!(record.frame_count(), 1);
    assert_eq!(record.images[0].frametype, "atoms");
    assert!(!sim.is_recording());
}

#[tokio::test]
async fn test_geometry_change_between_shots_keeps_frames() {
    let (mut worker, _sim) = worker(config()).await;
    let first = shot(vec![exposure("atoms", 0.1)], CameraAttributes::new());
    arm(&mut worker, &first).await;
    assert!(worker.transition_to_manual().await.unwrap());
    assert_eq!(first.saved_images("camera").unwrap().images[0].frames[0].width(), 8);

    let binned = CameraAttributes::from([(
        "Binning".to_string(),
        AttributeValue::Tuple(vec![2, 2]),
    )]);
    let second = shot(vec![exposure("atoms", 0.1)], binned);
    arm(&mut worker, &second).await;
    assert!(worker.transition_to_manual().await.unwrap());
    let record = second.saved_images("camera").unwrap();
    assert!(!record.failed_shot);
    let frame = &record.images[0].frames[0];
    assert_eq!((frame.width(), frame.height()), (4, 3));
}

#[tokio::test]
async fn test_abort_then_next_shot_succeeds() {
    let (mut worker, sim) = worker(config()).await;
    sim.set_trigger_budget(Some(0));
    let first = shot(vec![exposure("atoms", 0.1), exposure("flat", 0.2)], CameraAttributes::new());
    arm(&mut worker, &first).await;
    assert!(worker.abort_buffered().await.unwrap());
    assert!(first.saved_images("camera").is_none());

    // A stale abort request must not cut the next shot short
    sim.set_trigger_budget(None);
    let second = shot(vec![exposure("atoms", 0.1), exposure("flat", 0.2)], CameraAttributes::new());
    arm(&mut worker, &second).await;
    assert!(worker.transition_to_manual().await.unwrap());
    let record = second.saved_images("camera").unwrap();
    assert!(!record.failed_shot);
    assert_eq!(record.frame_count(), 2);
}

#[tokio::test]
async fn test_too_many_exposures_rejected() {
    let (mut worker, _sim) = worker(config()).await;
    let exposures = (0..17).map(|i| exposure("atoms", f64::from(i))).collect();
    let shot: Arc<dyn ShotFile> = shot(exposures, CameraAttributes::new());
    let err = worker
        .transition_to_buffered("camera", shot, &ChannelValues::new(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::Validation(_)));
}

#[tokio::test]
async fn test_shot_without_exposures() {
    let (mut worker, sim) = worker(config()).await;
    let shot = Arc::new(MemoryShotFile::new());
    arm(&mut worker, &shot).await;
    assert!(worker.transition_to_manual().await.unwrap());
    assert!(shot.saved_images("camera").is_none());
    assert_eq!(sim.allocated_buffers(), 0);
}

#[tokio::test]
async fn test_continuous_pauses_for_shot() {
    let (mut worker, sim) = worker(config()).await;
    worker.start_continuous(Duration::from_millis(2)).await.unwrap();
    let mut frames = worker.subscribe();
    let frame = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match frames.recv().await {
                Ok(frame) => break frame,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("frame channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!((frame.width(), frame.height()), (8, 6));
    assert!(worker.snap().await.is_err());

    let shot = shot(vec![exposure("atoms", 0.1)], CameraAttributes::new());
    arm(&mut worker, &shot).await;
    assert!(!worker.is_acquiring_continuously());
    assert!(worker.transition_to_manual().await.unwrap());
    assert_eq!(shot.saved_images("camera").unwrap().frame_count(), 1);
    assert!(worker.is_acquiring_continuously());

    worker.stop_continuous(false).await.unwrap();
    assert!(!sim.is_recording());
    let snapped = worker.snap().await.unwrap();
    assert_eq!(snapped.pixel(1, 1), Some(9));

    worker.shutdown().await.unwrap();
    assert!(sim.is_closed());
}

#[tokio::test]
async fn test_wrong_serial_fails_init() {
    let library = SimulatedPcoLibrary::new(vec![SimulatedPcoCamera::new(1, 4, 4, 16)]);
    let mut worker = PcoCameraWorker::new("camera", &config(), Box::new(library));
    let err = worker.init().await.unwrap_err();
    assert!(err
        .to_string()
        .contains("Could not find PCO Camera with serial number 269, found serial numbers: [1]"));
}

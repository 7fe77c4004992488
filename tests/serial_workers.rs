//! Serial-bus workers against simulated transports.
//!
//! Run with: cargo test --test serial_workers

use lab_devices::config::{Agilent83650bConfig, ElliptecAxisConfig, ElliptecConfig, ElliptecUnits};
use lab_devices::devices::agilent_83650b::Agilent83650BWorker;
use lab_devices::devices::elliptec::ElliptecWorker;
use lab_devices::devices::models::ChildModel;
use lab_devices::error_recovery::RetryPolicy;
use lab_devices::hardware::mock::{
    SimHandle, SimulatedElliptecBus, SimulatedSynthesizer, SimulatedTransport,
};
use lab_devices::shot::{MemoryShotFile, ShotFile};
use lab_devices::worker::{ChannelValue, DdsValues};
use lab_devices::{ChannelValues, DeviceError, DeviceWorker};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_delay: Duration::ZERO,
    }
}

fn count_prefixed(lines: &[String], prefix: &str) -> usize {
    lines.iter().filter(|l| l.starts_with(prefix)).count()
}

// =============================================================================
// Agilent 83650B
// =============================================================================

async fn synth() -> (Agilent83650BWorker, SimHandle<SimulatedSynthesizer>) {
    let config = Agilent83650bConfig {
        com_port: "COM4".into(),
        gpib_address: 19,
        baud_rate: 115_200,
        timeout_ms: 100,
        ramp_between_frequencies: false,
    };
    let transport = SimulatedTransport::new("synth", SimulatedSynthesizer::new(19));
    let handle = transport.handle();
    let mut worker = Agilent83650BWorker::new("synth", &config, Box::new(transport), retry());
    worker.init().await.unwrap();
    (worker, handle)
}

fn synth_shot(freq: f64) -> Arc<dyn ShotFile> {
    Arc::new(MemoryShotFile::new().with_static_values(
        "synth",
        BTreeMap::from([
            ("freq".to_string(), freq),
            ("amp".to_string(), -3.0),
            ("gate".to_string(), 1.0),
        ]),
    ))
}

#[tokio::test]
async fn test_synth_smart_programming() {
    let (mut worker, handle) = synth().await;
    handle.clear_writes();

    let values = worker
        .transition_to_buffered("synth", synth_shot(2.5e9), &ChannelValues::new(), false)
        .await
        .unwrap();
    assert_eq!(
        values["dds 0"],
        ChannelValue::Dds(DdsValues {
            freq: 2.5e9,
            amp: -3.0,
            gate: true
        })
    );
    assert_eq!(count_prefixed(&handle.written_lines(), ":FREQuency:CW "), 1);

    // Same table again: nothing to write
    worker
        .transition_to_buffered("synth", synth_shot(2.5e9), &ChannelValues::new(), false)
        .await
        .unwrap();
    let lines = handle.written_lines();
    assert_eq!(count_prefixed(&lines, ":FREQuency:CW "), 1);
    assert_eq!(count_prefixed(&lines, ":POWer:LEVel "), 1);

    // New frequency only
    worker
        .transition_to_buffered("synth", synth_shot(3.0e9), &ChannelValues::new(), false)
        .await
        .unwrap();
    let lines = handle.written_lines();
    assert_eq!(count_prefixed(&lines, ":FREQuency:CW "), 2);
    assert_eq!(count_prefixed(&lines, ":POWer:LEVel "), 1);

    // Fresh forces every setting
    worker
        .transition_to_buffered("synth", synth_shot(3.0e9), &ChannelValues::new(), true)
        .await
        .unwrap();
    let lines = handle.written_lines();
    assert_eq!(count_prefixed(&lines, ":FREQuency:CW "), 3);
    assert_eq!(count_prefixed(&lines, ":POWer:LEVel "), 2);
    assert!(handle.with_device(|d| d.output_enabled));
}

#[tokio::test]
async fn test_synth_rejects_out_of_range_before_writing() {
    let (mut worker, handle) = synth().await;
    handle.clear_writes();
    let values = ChannelValues::from([(
        "dds 0".to_string(),
        ChannelValue::Dds(DdsValues {
            freq: 60e9,
            amp: 0.0,
            gate: true,
        }),
    )]);
    let err = worker.program_manual(&values).await.unwrap_err();
    assert!(matches!(err, DeviceError::Validation(_)));
    assert!(handle.writes().is_empty());
}

#[tokio::test]
async fn test_synth_connects_after_retries() {
    let config = Agilent83650bConfig {
        com_port: "COM4".into(),
        gpib_address: 7,
        baud_rate: 115_200,
        timeout_ms: 100,
        ramp_between_frequencies: false,
    };
    let transport = SimulatedTransport::new("synth", SimulatedSynthesizer::new(7));
    transport.handle().fail_next_opens(2);
    let mut worker = Agilent83650BWorker::new("synth", &config, Box::new(transport), retry());
    worker.init().await.unwrap();

    let transport = SimulatedTransport::new("synth", SimulatedSynthesizer::new(7));
    transport.handle().fail_next_opens(3);
    let mut worker = Agilent83650BWorker::new("synth", &config, Box::new(transport), retry());
    assert!(worker.init().await.is_err());
}

// =============================================================================
// Elliptec
// =============================================================================

async fn rotators() -> (ElliptecWorker, SimHandle<SimulatedElliptecBus>) {
    let axis = |connection: &str| ElliptecAxisConfig {
        connection: connection.into(),
        model: ChildModel::Ell14,
        serial_number: None,
        home_on_startup: false,
        limits: None,
        units: ElliptecUnits::Counts,
    };
    let config = ElliptecConfig {
        com_port: "COM3".into(),
        baud_rate: 9600,
        timeout_ms: 100,
        axes: vec![axis("0"), axis("A")],
    };
    let transport =
        SimulatedTransport::new("rotators", SimulatedElliptecBus::with_addresses([0x0, 0xA]));
    let handle = transport.handle();
    let mut worker = ElliptecWorker::new("rotators", &config, Box::new(transport), retry()).unwrap();
    worker.init().await.unwrap();
    (worker, handle)
}

#[tokio::test]
async fn test_elliptec_moves_only_changed_axes() {
    let (mut worker, handle) = rotators().await;
    let shot = |a: f64, b: f64| -> Arc<dyn ShotFile> {
        Arc::new(MemoryShotFile::new().with_static_values(
            "rotators",
            BTreeMap::from([("0".to_string(), a), ("A".to_string(), b)]),
        ))
    };

    let values = worker
        .transition_to_buffered("rotators", shot(1000.4, 5000.0), &ChannelValues::new(), false)
        .await
        .unwrap();
    assert_eq!(values["0"], ChannelValue::Analog(1000.0));
    assert_eq!(values["A"], ChannelValue::Analog(5000.0));

    worker
        .transition_to_buffered("rotators", shot(1000.0, 6000.0), &ChannelValues::new(), false)
        .await
        .unwrap();
    assert_eq!(handle.with_device(|bus| bus.module(0x0).unwrap().absolute_moves), 1);
    assert_eq!(handle.with_device(|bus| bus.module(0xA).unwrap().absolute_moves), 2);

    let remote = worker.check_remote_values().await.unwrap();
    assert_eq!(remote["A"], ChannelValue::Analog(6000.0));
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_elliptec_unknown_connection() {
    let (mut worker, _handle) = rotators().await;
    let values = ChannelValues::from([("5".to_string(), ChannelValue::Analog(10.0))]);
    let err = worker.program_manual(&values).await.unwrap_err();
    assert!(matches!(err, DeviceError::Validation(_)));
}

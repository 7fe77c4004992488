use crate::config::PcoCameraConfig;
use crate::devices::pco::camera::{AbortHandle, PcoCamera};
use crate::devices::pco::sdk::PcoLibrary;
use crate::devices::pco::Frame;
use crate::error::{AppResult, DeviceError};
use crate::shot::{CameraAttributes, Exposure, ImageRecord, SavedImage, ShotFile};
use crate::worker::{ChannelValues, DeviceWorker};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

const CONTINUOUS_BUFFER_COUNT: usize = 2;
const FRAME_CHANNEL_CAPACITY: usize = 16;

const INCOMPLETE_ACQUISITION: &str = "Acquisition thread did not finish. Likely did not \
     acquire expected number of images. Check triggering is connected/configured correctly";

struct BufferedAcquisition {
    shot: Arc<dyn ShotFile>,
    image_path: String,
    exposures: Vec<Exposure>,
    attributes: CameraAttributes,
    task: JoinHandle<Vec<Frame>>,
}

struct ContinuousAcquisition {
    stop: Arc<AtomicBool>,
    task: JoinHandle<AppResult<()>>,
}

/// Worker for a PCO camera.
///
/// SDK calls run on blocking threads. During a shot the acquisition thread
/// holds the camera lock; the worker reaches it only through the abort flag
/// until the thread has been joined.
pub struct PcoCameraWorker {
    name: String,
    config: PcoCameraConfig,
    library: Option<Box<dyn PcoLibrary>>,
    camera: Option<Arc<Mutex<PcoCamera>>>,
    abort: AbortHandle,
    smart_cache: CameraAttributes,
    acquisition: Option<BufferedAcquisition>,
    continuous: Option<ContinuousAcquisition>,
    continuous_interval: Option<Duration>,
    frames: broadcast::Sender<Arc<Frame>>,
}

impl PcoCameraWorker {
    /// Worker that opens its camera through `library` once initialised.
    pub fn new(
        name: impl Into<String>,
        config: &PcoCameraConfig,
        library: Box<dyn PcoLibrary>,
    ) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            config: config.clone(),
            library: Some(library),
            camera: None,
            abort: AbortHandle::default(),
            smart_cache: CameraAttributes::new(),
            acquisition: None,
            continuous: None,
            continuous_interval: None,
            frames,
        }
    }

    /// Frames produced by continuous acquisition.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.frames.subscribe()
    }

    /// Whether continuous acquisition is running.
    pub fn is_acquiring_continuously(&self) -> bool {
        self.continuous.is_some()
    }

    fn camera(&self) -> AppResult<Arc<Mutex<PcoCamera>>> {
        self.camera.as_ref().map(Arc::clone).ok_or(DeviceError::NotConnected)
    }

    async fn with_camera<R, F>(&mut self, f: F) -> AppResult<R>
    where
        F: FnOnce(&mut PcoCamera) -> AppResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let camera = self.camera()?;
        tokio::task::spawn_blocking(move || {
            let mut camera = camera.blocking_lock();
            f(&mut camera)
        })
        .await?
    }

    /// Apply only the attributes that differ from what was last applied.
    pub async fn set_attributes_smart(&mut self, attributes: &CameraAttributes) -> AppResult<()> {
        let changed: CameraAttributes = attributes
            .iter()
            .filter(|(name, value)| self.smart_cache.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if changed.is_empty() {
            trace!("Camera attributes unchanged");
            return Ok(());
        }
        debug!(count = changed.len(), "Setting camera attributes");

        let to_apply = changed.clone();
        match self.with_camera(move |c| c.set_attributes(&to_apply)).await {
            Ok(()) => {
                self.smart_cache.extend(changed);
                Ok(())
            }
            Err(e) => {
                // Unknown how far it got
                self.smart_cache.clear();
                Err(e)
            }
        }
    }

    /// Every attribute as currently set on the camera.
    pub async fn get_attributes(&mut self) -> AppResult<CameraAttributes> {
        self.with_camera(|c| c.get_attributes()).await
    }

    /// Take a single software-triggered image.
    pub async fn snap(&mut self) -> AppResult<Frame> {
        if self.continuous.is_some() {
            return Err(DeviceError::Instrument(
                "Stop continuous acquisition before snapping".to_string(),
            ));
        }
        self.with_camera(|c| c.snap()).await
    }

    /// Grab frames continuously and publish them to subscribers, pausing
    /// `interval` between frames.
    pub async fn start_continuous(&mut self, interval: Duration) -> AppResult<()> {
        if self.continuous.is_some() {
            return Ok(());
        }
        self.with_camera(|c| c.configure_acquisition(true, CONTINUOUS_BUFFER_COUNT, false))
            .await?;

        let camera = self.camera()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let frames = self.frames.clone();
        let task = tokio::task::spawn_blocking(move || -> AppResult<()> {
            while !stop_flag.load(Ordering::SeqCst) {
                let grabbed = camera.blocking_lock().grab();
                match grabbed {
                    Ok(frame) => {
                        if frames.send(Arc::new(frame)).is_err() {
                            trace!("No frame subscribers");
                        }
                    }
                    Err(DeviceError::Pco(e)) if e.is_timeout() => continue,
                    Err(e) => return Err(e),
                }
                if !interval.is_zero() {
                    std::thread::sleep(interval);
                }
            }
            Ok(())
        });

        self.continuous = Some(ContinuousAcquisition { stop, task });
        self.continuous_interval = Some(interval);
        info!(device = %self.name, ?interval, "Started continuous acquisition");
        Ok(())
    }

    /// Stop continuous acquisition. With `pause` it resumes after the next
    /// shot.
    pub async fn stop_continuous(&mut self, pause: bool) -> AppResult<()> {
        if let Some(continuous) = self.continuous.take() {
            continuous.stop.store(true, Ordering::SeqCst);
            if let Err(e) = continuous.task.await? {
                warn!(device = %self.name, error = %e, "Continuous acquisition ended with an error");
            }
            self.with_camera(|c| c.stop_acquisition()).await?;
            info!(device = %self.name, pause, "Stopped continuous acquisition");
        }
        if !pause {
            self.continuous_interval = None;
        }
        Ok(())
    }

    async fn restore_manual_mode(&mut self) -> AppResult<()> {
        info!("Setting manual mode camera attributes.");
        let manual = self.config.manual_mode_camera_attributes.clone();
        self.set_attributes_smart(&manual).await?;
        self.resume_continuous().await
    }

    async fn resume_continuous(&mut self) -> AppResult<()> {
        if let Some(interval) = self.continuous_interval {
            self.start_continuous(interval).await?;
        }
        Ok(())
    }

    async fn abort_acquisition(&mut self) -> AppResult<bool> {
        if let Some(acquisition) = self.acquisition.take() {
            self.abort.abort();
            if let Err(e) = acquisition.task.await {
                warn!(device = %self.name, error = %e, "Acquisition thread failed");
            }
            self.abort.clear();
        }
        self.with_camera(|c| c.stop_acquisition()).await?;
        self.restore_manual_mode().await?;
        Ok(true)
    }
}

/// Pair exposures, in trigger order, with frames and group them by
/// `(name, frametype)`.
fn group_images(mut exposures: Vec<Exposure>, frames: Vec<Frame>) -> Vec<SavedImage> {
    exposures.sort_by(|a, b| a.t.total_cmp(&b.t));
    let mut groups: Vec<SavedImage> = Vec::new();
    for (exposure, frame) in exposures.into_iter().zip(frames) {
        match groups
            .iter_mut()
            .find(|g| g.name == exposure.name && g.frametype == exposure.frametype)
        {
            Some(group) => group.frames.push(frame),
            None => groups.push(SavedImage {
                name: exposure.name,
                frametype: exposure.frametype,
                frames: vec![frame],
            }),
        }
    }
    groups
}

#[async_trait]
impl DeviceWorker for PcoCameraWorker {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(device = %self.name))]
    async fn init(&mut self) -> AppResult<()> {
        let mut library = self.library.take().ok_or_else(|| {
            DeviceError::Configuration(format!("{} is already initialised", self.name))
        })?;
        let serial_number = self.config.serial_number;
        let grab_timeout = Duration::from_millis(self.config.grab_timeout_ms);
        let abort_check_period = Duration::from_millis(self.config.abort_check_period_ms);

        let camera = tokio::task::spawn_blocking(move || -> AppResult<PcoCamera> {
            let mut camera = PcoCamera::open(library.as_mut(), serial_number)?;
            camera.set_grab_timeout(grab_timeout);
            camera.set_abort_check_period(abort_check_period);
            Ok(camera)
        })
        .await??;
        self.abort = camera.abort_handle();
        self.camera = Some(Arc::new(Mutex::new(camera)));

        self.smart_cache.clear();
        let buffered = self.config.camera_attributes.clone();
        self.set_attributes_smart(&buffered).await?;
        let manual = self.config.manual_mode_camera_attributes.clone();
        self.set_attributes_smart(&manual).await?;
        info!(serial_number, "Camera ready");
        Ok(())
    }

    async fn program_manual(&mut self, _values: &ChannelValues) -> AppResult<ChannelValues> {
        Ok(ChannelValues::new())
    }

    async fn check_remote_values(&mut self) -> AppResult<ChannelValues> {
        Ok(ChannelValues::new())
    }

    #[instrument(skip(self, shot, _initial_values), fields(device = %self.name))]
    async fn transition_to_buffered(
        &mut self,
        device_name: &str,
        shot: Arc<dyn ShotFile>,
        _initial_values: &ChannelValues,
        fresh: bool,
    ) -> AppResult<ChannelValues> {
        if self.continuous.is_some() {
            self.stop_continuous(true).await?;
        }

        let exposures = shot.camera_exposures(device_name)?;
        if exposures.is_empty() {
            info!("No camera exposures in this shot.");
            return Ok(ChannelValues::new());
        }
        let attributes = match shot.camera_attributes(device_name)? {
            Some(attributes) => attributes,
            None => self.config.camera_attributes.clone(),
        };

        if fresh {
            self.smart_cache.clear();
        }
        info!("Configuring camera for {} images.", exposures.len());
        self.set_attributes_smart(&attributes).await?;
        let saved_attributes = self.get_attributes().await?;

        let n_images = exposures.len();
        self.with_camera(move |c| c.configure_acquisition(false, n_images, false))
            .await?;

        let camera = self.camera()?;
        let task = tokio::task::spawn_blocking(move || {
            let mut camera = camera.blocking_lock();
            let mut images = Vec::with_capacity(n_images);
            if let Err(e) = camera.grab_multiple(n_images, &mut images) {
                error!(error = %e, "Acquisition failed after {} images", images.len());
            }
            images
        });

        let image_path = self
            .config
            .orientation
            .clone()
            .unwrap_or_else(|| device_name.to_string());
        self.acquisition = Some(BufferedAcquisition {
            shot,
            image_path,
            exposures,
            attributes: saved_attributes,
            task,
        });
        Ok(ChannelValues::new())
    }

    #[instrument(skip(self), fields(device = %self.name))]
    async fn transition_to_manual(&mut self) -> AppResult<bool> {
        let Some(mut acquisition) = self.acquisition.take() else {
            info!("No camera exposures in this shot.");
            self.resume_continuous().await?;
            return Ok(true);
        };

        let timeout = Duration::from_secs_f64(self.config.stop_acquisition_timeout_secs.max(0.0));
        let images = match tokio::time::timeout(timeout, &mut acquisition.task).await {
            Ok(joined) => joined?,
            Err(_) => {
                if self.config.exception_on_failed_shot {
                    self.acquisition = Some(acquisition);
                    self.abort_acquisition().await?;
                    return Err(DeviceError::Instrument(INCOMPLETE_ACQUISITION.to_string()));
                }
                self.abort.abort();
                let images = (&mut acquisition.task).await?;
                self.abort.clear();
                warn!("{}", INCOMPLETE_ACQUISITION);
                images
            }
        };
        self.with_camera(|c| c.stop_acquisition()).await?;

        let expected = acquisition.exposures.len();
        let acquired = images.len();
        let failed_shot = acquired != expected;
        if failed_shot {
            warn!("Saving {}/{} images.", acquired, expected);
        } else {
            info!("Saving {} images.", acquired);
        }
        let record = ImageRecord {
            camera: self.name.clone(),
            failed_shot,
            attributes: Some(acquisition.attributes),
            images: group_images(acquisition.exposures, images),
        };
        acquisition
            .shot
            .save_images(&acquisition.image_path, record)?;

        self.restore_manual_mode().await?;

        if failed_shot && self.config.exception_on_failed_shot {
            return Err(DeviceError::Instrument(format!(
                "Acquired {} of {} expected images",
                acquired, expected
            )));
        }
        Ok(true)
    }

    async fn abort_buffered(&mut self) -> AppResult<bool> {
        self.abort_acquisition().await
    }

    async fn abort_transition_to_buffered(&mut self) -> AppResult<bool> {
        self.abort_acquisition().await
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if self.camera.is_none() {
            return Ok(());
        }
        self.stop_continuous(false).await?;
        if self.acquisition.is_some() {
            self.abort_acquisition().await?;
        }
        self.with_camera(|c| c.close()).await?;
        self.camera = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedPcoCamera, SimulatedPcoLibrary};
    use crate::shot::MemoryShotFile;
    use tracing_test::traced_test;

    fn exposure(name: &str, frametype: &str, t: f64) -> Exposure {
        Exposure {
            name: name.into(),
            frametype: frametype.into(),
            t,
        }
    }

    fn frame(value: u16) -> Frame {
        Frame::new(1, 1, vec![value]).unwrap()
    }

    #[test]
    fn test_group_images_in_trigger_order() {
        let exposures = vec![
            exposure("absorption", "flat", 0.3),
            exposure("absorption", "atoms", 0.1),
            exposure("absorption", "dark", 0.5),
            exposure("absorption", "atoms", 0.2),
        ];
        let groups = group_images(exposures, vec![frame(1), frame(2), frame(3), frame(4)]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].frametype, "atoms");
        assert_eq!(groups[0].frames, vec![frame(1), frame(2)]);
        assert_eq!(groups[1].frametype, "flat");
        assert_eq!(groups[1].frames, vec![frame(3)]);
        assert_eq!(groups[2].frames, vec![frame(4)]);
    }

    #[test]
    fn test_group_images_missing_frames() {
        let exposures = vec![exposure("fluo", "atoms", 0.1), exposure("fluo", "bg", 0.2)];
        let groups = group_images(exposures, vec![frame(9)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].frametype, "atoms");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shot_without_exposures_is_logged() {
        let config: PcoCameraConfig = serde_json::from_str(r#"{"serial_number": 3}"#).unwrap();
        let library = SimulatedPcoLibrary::new(vec![SimulatedPcoCamera::new(3, 4, 4, 16)]);
        let mut worker = PcoCameraWorker::new("camera", &config, Box::new(library));
        worker.init().await.unwrap();

        let shot: Arc<dyn ShotFile> = Arc::new(MemoryShotFile::new());
        let values = worker
            .transition_to_buffered("camera", shot, &ChannelValues::new(), false)
            .await
            .unwrap();
        assert!(values.is_empty());
        assert!(worker.transition_to_manual().await.unwrap());
        assert!(logs_contain("No camera exposures in this shot."));
    }
}

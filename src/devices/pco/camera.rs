//! High-level PCO camera driver.
//!
//! Wraps an open SDK camera and owns the ring of DMA buffers:
//!
//! ```text
//! Idle -> Configured -> Recording -> Draining -> Stopped
//!   ^                                               |
//!   +------------- clean_up_buffers ----------------+
//! ```
//!
//! Every method blocks on the SDK. The only thing another thread may touch
//! while an acquisition runs is the [`AbortHandle`].

use crate::devices::pco::attributes::{self, SDK_ATTRIBUTES};
use crate::devices::pco::error::NO_MORE_CAMERAS;
use crate::devices::pco::sdk::{CameraDescription, PcoCameraSdk, PcoLibrary};
use crate::devices::pco::{AttributeValue, Frame, Roi};
use crate::error::{AppResult, DeviceError};
use crate::shot::CameraAttributes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Most buffers the SDK hands out per camera.
pub const MAX_BUFFER_COUNT: usize = 16;

const STORAGE_MODE_FIFO: u16 = 1;
const RECORDER_SUBMODE_RING_BUFFER: u16 = 1;
const BIT_ALIGNMENT_LSB: u16 = 1;

/// Where the buffer ring is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No buffers allocated.
    Idle,
    /// Settings armed, not yet recording.
    Configured,
    /// Recording with buffers queued.
    Recording,
    /// Copying frames out of filled buffers.
    Draining,
    /// Recording stopped; buffers may still be allocated.
    Stopped,
}

/// Cross-thread request to end `grab_multiple` early.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Ask the running acquisition to stop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort is pending.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Withdraw a pending abort.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// An open PCO camera.
pub struct PcoCamera {
    sdk: Box<dyn PcoCameraSdk>,
    serial_number: u32,
    description: CameraDescription,
    bit_depth: u16,
    roi: Roi,
    fliplr: bool,
    flipud: bool,
    grab_timeout: Duration,
    abort_check_period: Duration,
    queue: VecDeque<i16>,
    running_continuously: bool,
    using_hardware_trigger: bool,
    state: AcquisitionState,
    abort: AbortHandle,
}

impl PcoCamera {
    /// Open the camera with `serial_number` and bring it to a clean default
    /// state: not recording, no buffers, full-frame ROI, no flips.
    pub fn open(library: &mut dyn PcoLibrary, serial_number: u32) -> AppResult<Self> {
        let mut sdk = open_by_serial(library, serial_number)?;
        let description = sdk.camera_description()?;
        let mut camera = Self {
            sdk,
            serial_number,
            description,
            bit_depth: description.dyn_res,
            roi: Roi::full(
                usize::from(description.max_horz_res_std),
                usize::from(description.max_vert_res_std),
            ),
            fliplr: false,
            flipud: false,
            grab_timeout: Duration::from_secs(1),
            abort_check_period: Duration::from_secs(1),
            queue: VecDeque::new(),
            running_continuously: false,
            using_hardware_trigger: true,
            state: AcquisitionState::Idle,
            abort: AbortHandle::default(),
        };
        camera.reinitialize_camera()?;
        camera.set_roi(camera.roi)?;
        info!(
            serial_number,
            bit_depth = camera.bit_depth,
            width = description.max_horz_res_std,
            height = description.max_vert_res_std,
            "Opened PCO camera"
        );
        Ok(camera)
    }

    /// Stop recording, free all buffers, restore SDK defaults with LSB bit
    /// alignment.
    pub fn reinitialize_camera(&mut self) -> AppResult<()> {
        self.stop_acquisition()?;
        self.clean_up_buffers()?;
        self.sdk.reset_settings_to_default()?;
        self.sdk.set_bit_alignment(BIT_ALIGNMENT_LSB)?;
        Ok(())
    }

    /// Cancel queued buffers and free every buffer index.
    pub fn clean_up_buffers(&mut self) -> AppResult<()> {
        self.sdk.cancel_images()?;
        for index in 0..MAX_BUFFER_COUNT as i16 {
            // Most indices are not allocated
            if let Err(e) = self.sdk.free_buffer(index) {
                trace!(index, error = %e, "FreeBuffer ignored");
            }
        }
        self.queue.clear();
        self.state = AcquisitionState::Idle;
        Ok(())
    }

    /// Serial number the camera was opened with.
    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    /// Sensor description read at open.
    pub fn description(&self) -> CameraDescription {
        self.description
    }

    /// Bits per pixel.
    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    /// Software ROI applied to every frame.
    pub fn roi(&self) -> Roi {
        self.roi
    }

    /// Whether frames are mirrored left-to-right.
    pub fn fliplr(&self) -> bool {
        self.fliplr
    }

    /// Whether frames are mirrored top-to-bottom.
    pub fn flipud(&self) -> bool {
        self.flipud
    }

    /// Buffer ring state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Buffers handed to the SDK and not yet read back.
    pub fn queued_buffers(&self) -> usize {
        self.queue.len()
    }

    /// Whether the last configuration expects external triggers.
    pub fn using_hardware_trigger(&self) -> bool {
        self.using_hardware_trigger
    }

    /// Whether the last configuration requeues buffers after reading.
    pub fn running_continuously(&self) -> bool {
        self.running_continuously
    }

    /// Handle for aborting `grab_multiple` from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Timeout of a single `grab`.
    pub fn set_grab_timeout(&mut self, timeout: Duration) {
        self.grab_timeout = timeout;
    }

    /// How often `grab_multiple` looks for an abort request.
    pub fn set_abort_check_period(&mut self, period: Duration) {
        self.abort_check_period = period;
    }

    /// Names accepted by `set_attribute`.
    pub fn attribute_names(&self) -> Vec<&'static str> {
        attributes::attribute_names()
    }

    /// Apply several attributes.
    ///
    /// SDK attributes go first, in a fixed order, so that `ROI` is checked
    /// against the binning and sensor format being set alongside it. Unknown
    /// names are rejected before anything is applied.
    pub fn set_attributes(&mut self, attributes: &CameraAttributes) -> AppResult<()> {
        let names = self.attribute_names();
        if let Some(unknown) = attributes.keys().find(|k| !names.contains(&k.as_str())) {
            return Err(unknown_attribute(unknown));
        }
        for name in names {
            if let Some(value) = attributes.get(name) {
                self.set_attribute(name, value)?;
            }
        }
        Ok(())
    }

    /// Apply one attribute.
    pub fn set_attribute(&mut self, name: &str, value: &AttributeValue) -> AppResult<()> {
        debug!(name, value = %value, "Setting camera attribute");
        match name {
            attributes::ROI => match value {
                AttributeValue::Roi(roi) => self.set_roi(*roi),
                other => Err(DeviceError::Validation(format!(
                    "Camera attribute ROI must be a dict with the following keys: \
                     offsetX, offsetY, width, height but was set to {}",
                    other
                ))),
            },
            attributes::FLIPLR => {
                self.fliplr = flag(attributes::FLIPLR, value)?;
                Ok(())
            }
            attributes::FLIPUD => {
                self.flipud = flag(attributes::FLIPUD, value)?;
                Ok(())
            }
            sdk_name if SDK_ATTRIBUTES.contains(&sdk_name) => {
                self.sdk.set_attribute(sdk_name, value)?;
                self.refit_roi()
            }
            other => Err(unknown_attribute(other)),
        }
    }

    /// Arm so a geometry change takes effect, then fall back to the full
    /// frame if the stored ROI no longer fits it.
    fn refit_roi(&mut self) -> AppResult<()> {
        self.sdk.arm_camera()?;
        let (width, height) = self.image_size()?;
        if roi_overflow(&self.roi, width, height).is_some() {
            let full = Roi::full(width, height);
            warn!(roi = %self.roi, width, height, "ROI no longer fits the image, resetting to full frame");
            self.roi = full;
        }
        Ok(())
    }

    /// Read one attribute.
    pub fn get_attribute(&mut self, name: &str) -> AppResult<AttributeValue> {
        match name {
            attributes::ROI => Ok(AttributeValue::Roi(self.roi)),
            attributes::FLIPLR => Ok(AttributeValue::Bool(self.fliplr)),
            attributes::FLIPUD => Ok(AttributeValue::Bool(self.flipud)),
            sdk_name if SDK_ATTRIBUTES.contains(&sdk_name) => Ok(self.sdk.get_attribute(sdk_name)?),
            other => Err(unknown_attribute(other)),
        }
    }

    /// Read every attribute.
    pub fn get_attributes(&mut self) -> AppResult<CameraAttributes> {
        let mut values = CameraAttributes::new();
        for name in self.attribute_names() {
            values.insert(name.to_string(), self.get_attribute(name)?);
        }
        Ok(values)
    }

    /// Set the software ROI.
    ///
    /// The camera is armed first so the check uses the image size that the
    /// pending binning and sensor format will produce.
    pub fn set_roi(&mut self, roi: Roi) -> AppResult<()> {
        for (key, value) in roi.fields() {
            if value < 0 {
                return Err(DeviceError::Validation(format!(
                    "Camera attribute ROI's {} must be a nonnegative integer but is {}",
                    key, value
                )));
            }
        }

        self.sdk.arm_camera()?;
        let (width, height) = self.image_size()?;
        if let Some(message) = roi_overflow(&roi, width, height) {
            return Err(DeviceError::Validation(message));
        }
        self.roi = roi;
        Ok(())
    }

    /// Current image width and height in pixels, as of the last arm.
    pub fn image_size(&mut self) -> AppResult<(usize, usize)> {
        let sizes = self.sdk.get_sizes()?;
        Ok((usize::from(sizes.x_res_act), usize::from(sizes.y_res_act)))
    }

    /// Bytes needed for one image.
    pub fn buffer_size_bytes(&mut self) -> AppResult<usize> {
        let (width, height) = self.image_size()?;
        let bytes_per_pixel = usize::from(self.bit_depth).div_ceil(8);
        Ok(width * height * bytes_per_pixel)
    }

    /// Acquire a single image with a software trigger.
    pub fn snap(&mut self) -> AppResult<Frame> {
        self.configure_acquisition(false, 1, true)?;
        let frame = self.grab();
        self.stop_acquisition()?;
        frame
    }

    /// Start recording into `buffer_count` freshly allocated buffers.
    ///
    /// Attributes must already be set. External triggers are expected
    /// unless `continuous` or `snap` is set.
    pub fn configure_acquisition(
        &mut self,
        continuous: bool,
        buffer_count: usize,
        snap: bool,
    ) -> AppResult<()> {
        if buffer_count == 0 || buffer_count > MAX_BUFFER_COUNT {
            return Err(DeviceError::Validation(format!(
                "Buffer count must be between 1 and {} but is {}",
                MAX_BUFFER_COUNT, buffer_count
            )));
        }
        self.running_continuously = continuous;
        self.using_hardware_trigger = !(continuous || snap);

        self.stop_acquisition()?;
        self.clean_up_buffers()?;

        self.sdk.set_storage_mode(STORAGE_MODE_FIFO)?;
        // Only matters in recorder mode
        self.sdk.set_recorder_submode(RECORDER_SUBMODE_RING_BUFFER)?;
        self.sdk.arm_camera()?;
        self.state = AcquisitionState::Configured;

        // Recording has to run before buffers can be allocated
        self.sdk.set_recording_state(true)?;
        self.state = AcquisitionState::Recording;

        let size = self.buffer_size_bytes()?;
        for _ in 0..buffer_count {
            let index = self.sdk.allocate_buffer(size)?;
            self.queue_buffer(index)?;
        }
        debug!(
            buffer_count,
            size,
            continuous,
            hardware_trigger = self.using_hardware_trigger,
            "Acquisition configured"
        );
        Ok(())
    }

    fn queue_buffer(&mut self, index: i16) -> AppResult<()> {
        let sizes = self.sdk.get_sizes()?;
        self.sdk
            .add_buffer(index, sizes.x_res_act, sizes.y_res_act, self.bit_depth)?;
        self.queue.push_back(index);
        Ok(())
    }

    /// Wait for the oldest queued buffer and return its image.
    ///
    /// The buffer leaves the queue only once its image has been copied out,
    /// so a timeout or read failure can be retried. In continuous mode the
    /// buffer is requeued.
    pub fn grab(&mut self) -> AppResult<Frame> {
        let index = *self.queue.front().ok_or_else(no_buffers)?;
        self.sdk.wait_for_buffer(index, self.grab_timeout)?;
        let frame = self.frame_from_buffer(index)?;
        self.queue.pop_front();

        if self.running_continuously {
            self.queue_buffer(index)?;
        }
        Ok(frame)
    }

    /// Collect `n_images` into `images` during a buffered acquisition.
    ///
    /// Waits on the last queued buffer in slices of the abort-check period.
    /// An abort returns early without error and clears the request; buffer
    /// timeouts are retried; other SDK errors propagate.
    pub fn grab_multiple(&mut self, n_images: usize, images: &mut Vec<Frame>) -> AppResult<()> {
        let last = *self.queue.back().ok_or_else(no_buffers)?;
        info!(n_images, "Attempting to grab {} images.", n_images);
        loop {
            if self.abort.take() {
                info!("Abort during acquisition.");
                return Ok(());
            }
            match self.sdk.wait_for_buffer(last, self.abort_check_period) {
                Ok(()) => {
                    self.state = AcquisitionState::Draining;
                    for _ in 0..n_images {
                        images.push(self.grab()?);
                    }
                    break;
                }
                Err(e) if e.is_timeout() => {
                    trace!("Waiting for images");
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!("Got {} of {} images.", images.len(), n_images);
        Ok(())
    }

    fn frame_from_buffer(&mut self, index: i16) -> AppResult<Frame> {
        let (width, height) = self.image_size()?;
        let data = self.sdk.read_buffer(index, width * height)?;
        Ok(Frame::new(width, height, data)?.post_process(&self.roi, self.fliplr, self.flipud))
    }

    /// Stop recording if the camera is recording. Buffers stay allocated.
    pub fn stop_acquisition(&mut self) -> AppResult<()> {
        if self.sdk.get_recording_state()? {
            self.sdk.set_recording_state(false)?;
            self.state = AcquisitionState::Stopped;
        }
        Ok(())
    }

    /// Request `grab_multiple` to return early.
    pub fn abort_acquisition(&self) {
        self.abort.abort();
    }

    /// Close the SDK handle.
    pub fn close(&mut self) -> AppResult<()> {
        self.sdk.close_camera()?;
        info!(serial_number = self.serial_number, "Closed PCO camera");
        Ok(())
    }
}

fn open_by_serial(
    library: &mut dyn PcoLibrary,
    target: u32,
) -> AppResult<Box<dyn PcoCameraSdk>> {
    let mut others: Vec<Box<dyn PcoCameraSdk>> = Vec::new();
    let mut serial_numbers = Vec::new();

    let found = loop {
        let mut camera = match library.open_camera() {
            Ok(camera) => camera,
            Err(e) if e.return_code == NO_MORE_CAMERAS => break Ok(None),
            Err(e) => break Err(DeviceError::from(e)),
        };
        let serial = match camera.serial_number() {
            Ok(serial) => serial,
            Err(e) => {
                others.push(camera);
                break Err(e.into());
            }
        };
        serial_numbers.push(serial);
        if serial == target {
            break Ok(Some(camera));
        }
        others.push(camera);
    };

    for mut camera in others {
        if let Err(e) = camera.close_camera() {
            warn!(error = %e, "Failed to close unused PCO camera");
        }
    }

    found?.ok_or_else(|| {
        DeviceError::Instrument(format!(
            "Could not find PCO Camera with serial number {}, found serial numbers: {:?}",
            target, serial_numbers
        ))
    })
}

/// Why `roi` does not fit a `width` x `height` image, if it does not.
fn roi_overflow(roi: &Roi, width: usize, height: usize) -> Option<String> {
    let x_index_max = roi.offset_x.saturating_add(roi.width);
    let y_index_max = roi.offset_y.saturating_add(roi.height);
    if x_index_max > width as i64 {
        return Some(format!(
            "ROI's offsetX + width must be less than the image width ({}) but is {}",
            width, x_index_max
        ));
    }
    if y_index_max > height as i64 {
        return Some(format!(
            "ROI's offsetY + height must be less than the image height ({}) but is {}",
            height, y_index_max
        ));
    }
    None
}

fn flag(name: &str, value: &AttributeValue) -> AppResult<bool> {
    match value {
        AttributeValue::Bool(b) => Ok(*b),
        other => Err(DeviceError::Validation(format!(
            "Camera attribute {} must be a boolean but was set to {}",
            name, other
        ))),
    }
}

fn unknown_attribute(name: &str) -> DeviceError {
    DeviceError::Validation(format!(
        "Unknown camera attribute '{}'. Supported attributes: {}",
        name,
        attributes::attribute_names().join(", ")
    ))
}

fn no_buffers() -> DeviceError {
    DeviceError::Instrument("No buffers queued; configure the acquisition first".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedPcoCamera, SimulatedPcoLibrary};

    fn library() -> (SimulatedPcoLibrary, SimulatedPcoCamera) {
        let camera = SimulatedPcoCamera::new(269, 8, 6, 14);
        let library = SimulatedPcoLibrary::new(vec![SimulatedPcoCamera::new(100, 8, 6, 14), camera.clone()]);
        (library, camera)
    }

    #[test]
    fn test_open_by_serial_closes_others() {
        let (mut library, sim) = library();
        let other = library.camera(0).unwrap();
        let camera = PcoCamera::open(&mut library, 269).unwrap();
        assert_eq!(camera.serial_number(), 269);
        assert_eq!(camera.bit_depth(), 14);
        assert_eq!(camera.roi(), Roi::full(8, 6));
        assert!(other.is_closed());
        assert!(!sim.is_closed());
    }

    #[test]
    fn test_missing_serial_lists_found() {
        let (mut library, _) = library();
        let err = PcoCamera::open(&mut library, 7).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Instrument error: Could not find PCO Camera with serial number 7, found serial numbers: [100, 269]"
        );
    }

    #[test]
    fn test_roi_checked_against_binned_size() {
        let (mut library, _) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        let attrs = CameraAttributes::from([
            ("Binning".to_string(), AttributeValue::Tuple(vec![2, 2])),
            (
                "ROI".to_string(),
                AttributeValue::Roi(Roi {
                    offset_x: 1,
                    offset_y: 0,
                    width: 4,
                    height: 3,
                }),
            ),
        ]);
        let err = camera.set_attributes(&attrs).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value: ROI's offsetX + width must be less than the image width (4) but is 5"
        );
        // Binning went through and shrank the frame
        assert_eq!(camera.roi(), Roi::full(4, 3));
    }

    #[test]
    fn test_flip_must_be_bool() {
        let (mut library, _) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        let err = camera
            .set_attribute("fliplr", &AttributeValue::Int(1))
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Camera attribute fliplr must be a boolean but was set to 1"));
        assert!(camera.set_attribute("Gain", &AttributeValue::Int(1)).is_err());
    }

    #[test]
    fn test_recording_before_allocation() {
        let (mut library, sim) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        sim.clear_calls();
        camera.configure_acquisition(false, 3, false).unwrap();
        let calls = sim.calls();
        let recording = calls.iter().position(|c| c == "SetRecordingState(1)").unwrap();
        let first_alloc = calls.iter().position(|c| c.starts_with("AllocateBuffer")).unwrap();
        assert!(recording < first_alloc);
        assert_eq!(camera.queued_buffers(), 3);
        assert!(camera.using_hardware_trigger());
        assert_eq!(camera.state(), AcquisitionState::Recording);
    }

    #[test]
    fn test_snap_applies_roi_and_flip() {
        let (mut library, _) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        camera
            .set_roi(Roi {
                offset_x: 2,
                offset_y: 1,
                width: 2,
                height: 1,
            })
            .unwrap();
        camera.set_attribute("fliplr", &AttributeValue::Bool(true)).unwrap();
        let frame = camera.snap().unwrap();
        // Simulated pixel value is y * width + x
        assert_eq!(frame.data(), &[11, 10]);
        assert_eq!(camera.state(), AcquisitionState::Stopped);
    }

    #[test]
    fn test_abort_ends_grab_multiple() {
        let (mut library, sim) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        camera.set_abort_check_period(Duration::from_millis(5));
        sim.set_trigger_budget(Some(1));
        camera.configure_acquisition(false, 2, false).unwrap();

        camera.abort_acquisition();
        let mut images = Vec::new();
        camera.grab_multiple(2, &mut images).unwrap();
        assert!(images.is_empty());
        assert!(!camera.abort_handle().is_set());
    }

    #[test]
    fn test_grab_multiple_collects_all() {
        let (mut library, sim) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        sim.set_trigger_budget(Some(3));
        camera.configure_acquisition(false, 3, false).unwrap();
        let mut images = Vec::new();
        camera.grab_multiple(3, &mut images).unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(camera.queued_buffers(), 0);
    }

    #[test]
    fn test_binning_change_resets_roi() {
        let (mut library, _) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        camera
            .set_attribute("Binning", &AttributeValue::Tuple(vec![2, 2]))
            .unwrap();
        assert_eq!(camera.roi(), Roi::full(4, 3));
        let frame = camera.snap().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 3));

        // A ROI that still fits is kept
        let roi = Roi {
            offset_x: 1,
            offset_y: 1,
            width: 2,
            height: 2,
        };
        camera.set_roi(roi).unwrap();
        camera.set_attribute("TriggerMode", &AttributeValue::Int(0)).unwrap();
        assert_eq!(camera.roi(), roi);
    }

    #[test]
    fn test_failed_read_keeps_buffer_queued() {
        let (mut library, sim) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        camera.configure_acquisition(true, 2, false).unwrap();
        sim.set_read_budget(Some(0));
        assert!(camera.grab().is_err());
        assert_eq!(camera.queued_buffers(), 2);

        sim.set_read_budget(None);
        camera.grab().unwrap();
        assert_eq!(camera.queued_buffers(), 2);
    }

    #[test]
    fn test_clean_up_partial_buffer_set() {
        let (mut library, sim) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        camera.configure_acquisition(false, 3, false).unwrap();
        assert_eq!(sim.allocated_buffers(), 3);

        sim.clear_calls();
        camera.clean_up_buffers().unwrap();
        // Indices 3..16 were never allocated and fail to free
        let frees = sim.calls().iter().filter(|c| c.starts_with("FreeBuffer")).count();
        assert_eq!(frees, MAX_BUFFER_COUNT);
        assert_eq!(sim.allocated_buffers(), 0);
        assert_eq!(camera.queued_buffers(), 0);
        assert_eq!(camera.state(), AcquisitionState::Idle);
    }

    #[test]
    fn test_abort_keeps_collected_frames() {
        let (mut library, sim) = library();
        let mut camera = PcoCamera::open(&mut library, 269).unwrap();
        camera.set_abort_check_period(Duration::from_millis(5));
        camera.set_grab_timeout(Duration::from_millis(5));
        sim.set_trigger_budget(Some(1));
        camera.configure_acquisition(false, 3, false).unwrap();

        let mut images = vec![camera.grab().unwrap()];
        camera.abort_acquisition();
        camera.grab_multiple(2, &mut images).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(camera.queued_buffers(), 2);
        assert!(!camera.abort_handle().is_set());
    }
}

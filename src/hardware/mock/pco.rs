//! Simulated PCO SDK.
//!
//! Models the parts of the driver the acquisition pipeline depends on:
//! settings only take effect at arm, buffers can only be allocated while
//! recording, and queued buffers fill in FIFO order as triggers arrive.
//! Pixel `(x, y)` of every simulated image holds `y * width + x`.

use crate::devices::pco::error::{NO_MORE_CAMERAS, TIMEOUT};
use crate::devices::pco::sdk::{CameraDescription, PcoCameraSdk, PcoLibrary, SensorSizes};
use crate::devices::pco::{AttributeValue, PcoError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

// Simulator-only return codes
const ERROR_INVALID_BUFFER: i32 = 0x8023_2002_u32 as i32;
const ERROR_NOT_RECORDING: i32 = 0x8023_2003_u32 as i32;
const ERROR_UNKNOWN_SETTING: i32 = 0x8023_2004_u32 as i32;
const ERROR_CAMERA_CLOSED: i32 = 0x8023_2005_u32 as i32;

const MAX_BUFFERS: i16 = 16;

#[derive(Default)]
struct SimBuffer {
    size_bytes: usize,
    data: Option<Vec<u16>>,
}

struct CameraState {
    serial_number: u32,
    description: CameraDescription,
    pending_binning: (u16, u16),
    armed_binning: (u16, u16),
    settings: BTreeMap<String, AttributeValue>,
    recording: bool,
    buffers: BTreeMap<i16, SimBuffer>,
    queue: VecDeque<i16>,
    trigger_budget: Option<usize>,
    read_budget: Option<usize>,
    frames_delivered: usize,
    calls: Vec<String>,
    closed: bool,
}

impl CameraState {
    fn sizes(&self) -> SensorSizes {
        let (h_bin, v_bin) = self.armed_binning;
        SensorSizes {
            x_res_act: self.description.max_horz_res_std / h_bin.max(1),
            y_res_act: self.description.max_vert_res_std / v_bin.max(1),
            x_res_max: self.description.max_horz_res_std,
            y_res_max: self.description.max_vert_res_std,
        }
    }

    fn image(&self) -> Vec<u16> {
        let sizes = self.sizes();
        let (width, height) = (usize::from(sizes.x_res_act), usize::from(sizes.y_res_act));
        let mask = (1u32 << self.description.dyn_res.min(16)) - 1;
        (0..width * height)
            .map(|i| (i as u32 & mask) as u16)
            .collect()
    }

    /// Fill queued buffers for every trigger that is available.
    fn deliver(&mut self) {
        if !self.recording {
            return;
        }
        while let Some(&index) = self.queue.front() {
            match self.trigger_budget {
                Some(0) => break,
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            self.queue.pop_front();
            let image = self.image();
            if let Some(buffer) = self.buffers.get_mut(&index) {
                buffer.data = Some(image);
                self.frames_delivered += 1;
            }
        }
    }
}

/// Handle on one simulated camera. Clones share state, so a test can keep a
/// handle while the driver owns another.
#[derive(Clone)]
pub struct SimulatedPcoCamera {
    inner: Arc<Mutex<CameraState>>,
}

fn lock(inner: &Mutex<CameraState>) -> MutexGuard<'_, CameraState> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimulatedPcoCamera {
    /// Camera with a `width` x `height` sensor of `bit_depth` bits.
    pub fn new(serial_number: u32, width: u16, height: u16, bit_depth: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CameraState {
                serial_number,
                description: CameraDescription {
                    max_horz_res_std: width,
                    max_vert_res_std: height,
                    dyn_res: bit_depth,
                },
                pending_binning: (1, 1),
                armed_binning: (1, 1),
                settings: BTreeMap::new(),
                recording: false,
                buffers: BTreeMap::new(),
                queue: VecDeque::new(),
                trigger_budget: None,
                read_budget: None,
                frames_delivered: 0,
                calls: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Limit how many more images will be exposed. `None` fills every queued
    /// buffer as soon as it is waited on.
    pub fn set_trigger_budget(&self, budget: Option<usize>) {
        lock(&self.inner).trigger_budget = budget;
    }

    /// Limit how many more buffer reads succeed. `None` never fails a read.
    pub fn set_read_budget(&self, budget: Option<usize>) {
        lock(&self.inner).read_budget = budget;
    }

    /// SDK calls made so far.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.inner).calls.clone()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        lock(&self.inner).calls.clear();
    }

    /// Whether `close_camera` was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Whether the camera is recording.
    pub fn is_recording(&self) -> bool {
        lock(&self.inner).recording
    }

    /// Number of allocated buffers.
    pub fn allocated_buffers(&self) -> usize {
        lock(&self.inner).buffers.len()
    }

    /// Images written into buffers since the camera was created.
    pub fn frames_delivered(&self) -> usize {
        lock(&self.inner).frames_delivered
    }

    /// Value last set for an SDK attribute.
    pub fn setting(&self, name: &str) -> Option<AttributeValue> {
        lock(&self.inner).settings.get(name).cloned()
    }

    fn call(&self, name: String) -> Result<MutexGuard<'_, CameraState>, PcoError> {
        let mut state = lock(&self.inner);
        trace!(serial_number = state.serial_number, call = %name, "Simulated PCO call");
        state.calls.push(name);
        if state.closed {
            return Err(PcoError::new(ERROR_CAMERA_CLOSED));
        }
        Ok(state)
    }
}

impl PcoCameraSdk for SimulatedPcoCamera {
    fn serial_number(&mut self) -> Result<u32, PcoError> {
        Ok(self.call("GetCameraType".into())?.serial_number)
    }

    fn camera_description(&mut self) -> Result<CameraDescription, PcoError> {
        Ok(self.call("GetCameraDescription".into())?.description)
    }

    fn close_camera(&mut self) -> Result<(), PcoError> {
        self.call("CloseCamera".into())?.closed = true;
        Ok(())
    }

    fn reset_settings_to_default(&mut self) -> Result<(), PcoError> {
        let mut state = self.call("ResetSettingsToDefault".into())?;
        state.pending_binning = (1, 1);
        state.settings.clear();
        Ok(())
    }

    fn set_bit_alignment(&mut self, alignment: u16) -> Result<(), PcoError> {
        self.call(format!("SetBitAlignment({})", alignment))?;
        Ok(())
    }

    fn arm_camera(&mut self) -> Result<(), PcoError> {
        let mut state = self.call("ArmCamera".into())?;
        state.armed_binning = state.pending_binning;
        Ok(())
    }

    fn get_sizes(&mut self) -> Result<SensorSizes, PcoError> {
        Ok(self.call("GetSizes".into())?.sizes())
    }

    fn get_recording_state(&mut self) -> Result<bool, PcoError> {
        Ok(self.call("GetRecordingState".into())?.recording)
    }

    fn set_recording_state(&mut self, running: bool) -> Result<(), PcoError> {
        self.call(format!("SetRecordingState({})", u8::from(running)))?
            .recording = running;
        Ok(())
    }

    fn set_storage_mode(&mut self, mode: u16) -> Result<(), PcoError> {
        self.call(format!("SetStorageMode({})", mode))?;
        Ok(())
    }

    fn set_recorder_submode(&mut self, submode: u16) -> Result<(), PcoError> {
        self.call(format!("SetRecorderSubmode({})", submode))?;
        Ok(())
    }

    fn allocate_buffer(&mut self, size_bytes: usize) -> Result<i16, PcoError> {
        let mut state = self.call(format!("AllocateBuffer({})", size_bytes))?;
        if !state.recording {
            return Err(PcoError::new(ERROR_NOT_RECORDING));
        }
        let index = (0..MAX_BUFFERS)
            .find(|i| !state.buffers.contains_key(i))
            .ok_or(PcoError::new(ERROR_INVALID_BUFFER))?;
        state.buffers.insert(
            index,
            SimBuffer {
                size_bytes,
                data: None,
            },
        );
        Ok(index)
    }

    fn free_buffer(&mut self, index: i16) -> Result<(), PcoError> {
        let mut state = self.call(format!("FreeBuffer({})", index))?;
        state
            .buffers
            .remove(&index)
            .ok_or(PcoError::new(ERROR_INVALID_BUFFER))?;
        state.queue.retain(|&i| i != index);
        Ok(())
    }

    fn add_buffer(
        &mut self,
        index: i16,
        width: u16,
        height: u16,
        bit_depth: u16,
    ) -> Result<(), PcoError> {
        let mut state = self.call(format!("AddBufferEx({})", index))?;
        let sizes = state.sizes();
        let bytes_per_pixel = usize::from(bit_depth).div_ceil(8);
        let needed = usize::from(width) * usize::from(height) * bytes_per_pixel;
        let buffer = state
            .buffers
            .get_mut(&index)
            .ok_or(PcoError::new(ERROR_INVALID_BUFFER))?;
        if width != sizes.x_res_act || height != sizes.y_res_act || buffer.size_bytes < needed {
            return Err(PcoError::new(ERROR_INVALID_BUFFER));
        }
        buffer.data = None;
        state.queue.push_back(index);
        Ok(())
    }

    fn wait_for_buffer(&mut self, index: i16, timeout: Duration) -> Result<(), PcoError> {
        {
            let mut state = self.call(format!("WaitforBuffer({})", index))?;
            state.deliver();
            match state.buffers.get(&index) {
                Some(buffer) if buffer.data.is_some() => return Ok(()),
                Some(_) => {}
                None => return Err(PcoError::new(ERROR_INVALID_BUFFER)),
            }
        }
        std::thread::sleep(timeout);
        Err(PcoError::new(TIMEOUT))
    }

    fn read_buffer(&mut self, index: i16, pixels: usize) -> Result<Vec<u16>, PcoError> {
        let mut state = self.call(format!("ReadBuffer({})", index))?;
        match state.read_budget {
            Some(0) => return Err(PcoError::new(ERROR_INVALID_BUFFER)),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        let data = state
            .buffers
            .get(&index)
            .and_then(|b| b.data.as_ref())
            .ok_or(PcoError::new(ERROR_INVALID_BUFFER))?;
        if data.len() < pixels {
            return Err(PcoError::new(ERROR_INVALID_BUFFER));
        }
        Ok(data[..pixels].to_vec())
    }

    fn cancel_images(&mut self) -> Result<(), PcoError> {
        let mut state = self.call("CancelImages".into())?;
        state.queue.clear();
        Ok(())
    }

    fn set_attribute(&mut self, name: &str, value: &AttributeValue) -> Result<(), PcoError> {
        let mut state = self.call(format!("Set{}({})", name, value))?;
        if !crate::devices::pco::attributes::SDK_ATTRIBUTES.contains(&name) {
            return Err(PcoError::new(ERROR_UNKNOWN_SETTING));
        }
        if name == "Binning" {
            match value.as_args().as_deref() {
                Some(&[h, v]) if h > 0 && v > 0 => {
                    state.pending_binning = (h as u16, v as u16);
                }
                _ => return Err(PcoError::new(ERROR_UNKNOWN_SETTING)),
            }
        }
        state.settings.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn get_attribute(&mut self, name: &str) -> Result<AttributeValue, PcoError> {
        let state = self.call(format!("Get{}", name))?;
        if !crate::devices::pco::attributes::SDK_ATTRIBUTES.contains(&name) {
            return Err(PcoError::new(ERROR_UNKNOWN_SETTING));
        }
        if name == "Binning" {
            let (h, v) = state.pending_binning;
            return Ok(AttributeValue::Tuple(vec![i64::from(h), i64::from(v)]));
        }
        Ok(state
            .settings
            .get(name)
            .cloned()
            .unwrap_or(AttributeValue::Int(0)))
    }
}

/// Simulated SDK with a fixed set of attached cameras.
pub struct SimulatedPcoLibrary {
    cameras: Vec<SimulatedPcoCamera>,
    next: usize,
}

impl SimulatedPcoLibrary {
    /// Library that will open `cameras` in order.
    pub fn new(cameras: Vec<SimulatedPcoCamera>) -> Self {
        Self { cameras, next: 0 }
    }

    /// Handle on the `index`th attached camera.
    pub fn camera(&self, index: usize) -> Option<SimulatedPcoCamera> {
        self.cameras.get(index).cloned()
    }
}

impl PcoLibrary for SimulatedPcoLibrary {
    fn open_camera(&mut self) -> Result<Box<dyn PcoCameraSdk>, PcoError> {
        let camera = self
            .cameras
            .get(self.next)
            .cloned()
            .ok_or(PcoError::new(NO_MORE_CAMERAS))?;
        self.next += 1;
        lock(&camera.inner).closed = false;
        Ok(Box::new(camera))
    }
}

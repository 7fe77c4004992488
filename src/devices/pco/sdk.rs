//! PCO SDK boundary.
//!
//! These traits mirror the subset of `SC2_Cam` the camera driver uses. All
//! calls block; callers run them on a blocking thread. A real binding and the
//! simulated SDK in [`crate::hardware::mock::pco`] both implement them.

use crate::devices::pco::{AttributeValue, PcoError};
use std::time::Duration;

/// Subset of `PCO_CameraDescription`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraDescription {
    /// `wMaxHorzResStdDESC`
    pub max_horz_res_std: u16,
    /// `wMaxVertResStdDESC`
    pub max_vert_res_std: u16,
    /// `wDynResDESC`, bits per pixel.
    pub dyn_res: u16,
}

/// Result of `PCO_GetSizes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSizes {
    /// Current image width in pixels.
    pub x_res_act: u16,
    /// Current image height in pixels.
    pub y_res_act: u16,
    /// Maximum width in pixels.
    pub x_res_max: u16,
    /// Maximum height in pixels.
    pub y_res_max: u16,
}

/// SDK entry points that are not tied to an open camera.
pub trait PcoLibrary: Send {
    /// `PCO_OpenCamera`: open the next camera not already open. Returns
    /// [`super::error::NO_MORE_CAMERAS`] when none is left.
    fn open_camera(&mut self) -> Result<Box<dyn PcoCameraSdk>, PcoError>;
}

/// Calls on one open camera.
pub trait PcoCameraSdk: Send {
    /// `dwSerialNumber` from `PCO_GetCameraType`.
    fn serial_number(&mut self) -> Result<u32, PcoError>;

    /// `PCO_GetCameraDescription`
    fn camera_description(&mut self) -> Result<CameraDescription, PcoError>;

    /// `PCO_CloseCamera`
    fn close_camera(&mut self) -> Result<(), PcoError>;

    /// `PCO_ResetSettingsToDefault`
    fn reset_settings_to_default(&mut self) -> Result<(), PcoError>;

    /// `PCO_SetBitAlignment`; 0 for MSB, 1 for LSB.
    fn set_bit_alignment(&mut self, alignment: u16) -> Result<(), PcoError>;

    /// `PCO_ArmCamera`: validate and apply the pending settings.
    fn arm_camera(&mut self) -> Result<(), PcoError>;

    /// `PCO_GetSizes`, valid as of the last arm.
    fn get_sizes(&mut self) -> Result<SensorSizes, PcoError>;

    /// `PCO_GetRecordingState`
    fn get_recording_state(&mut self) -> Result<bool, PcoError>;

    /// `PCO_SetRecordingState`
    fn set_recording_state(&mut self, running: bool) -> Result<(), PcoError>;

    /// `PCO_SetStorageMode`; 0 recorder, 1 FIFO.
    fn set_storage_mode(&mut self, mode: u16) -> Result<(), PcoError>;

    /// `PCO_SetRecorderSubmode`; 0 sequence, 1 ring buffer.
    fn set_recorder_submode(&mut self, submode: u16) -> Result<(), PcoError>;

    /// `PCO_AllocateBuffer` with index -1: allocate a new buffer of
    /// `size_bytes` and return its index.
    fn allocate_buffer(&mut self, size_bytes: usize) -> Result<i16, PcoError>;

    /// `PCO_FreeBuffer`
    fn free_buffer(&mut self, index: i16) -> Result<(), PcoError>;

    /// `PCO_AddBufferEx(0, 0, index, width, height, bit_depth)`
    fn add_buffer(
        &mut self,
        index: i16,
        width: u16,
        height: u16,
        bit_depth: u16,
    ) -> Result<(), PcoError>;

    /// `PCO_WaitforBuffer` on a single buffer.
    fn wait_for_buffer(&mut self, index: i16, timeout: Duration) -> Result<(), PcoError>;

    /// Copy `pixels` 16-bit values out of buffer `index`.
    fn read_buffer(&mut self, index: i16, pixels: usize) -> Result<Vec<u16>, PcoError>;

    /// `PCO_CancelImages`: drop every queued buffer.
    fn cancel_images(&mut self) -> Result<(), PcoError>;

    /// `PCO_Set<name>` with the value unpacked into arguments.
    fn set_attribute(&mut self, name: &str, value: &AttributeValue) -> Result<(), PcoError>;

    /// `PCO_Get<name>`
    fn get_attribute(&mut self, name: &str) -> Result<AttributeValue, PcoError>;
}

//! Simulated Agilent 83650B behind a Prologix USB-GPIB adapter.

use crate::hardware::mock::SimulatedDevice;

/// Prologix adapter plus synthesizer.
///
/// SCPI lines only reach the synthesizer while `++addr` matches its GPIB
/// address. Query replies are held until `++read`.
#[derive(Debug, Clone)]
pub struct SimulatedSynthesizer {
    /// GPIB address the synthesizer listens on.
    pub gpib_address: u8,
    /// Adapter `++addr` setting.
    pub adapter_address: Option<u8>,
    /// Adapter `++mode`.
    pub mode: Option<u8>,
    /// Adapter `++auto`.
    pub auto_read: Option<u8>,
    /// CW frequency in Hz.
    pub frequency: f64,
    /// Power in dBm.
    pub power: f64,
    /// RF output on.
    pub output_enabled: bool,
    /// Number of SCPI set commands (not queries) received.
    pub set_commands: usize,
    pending: Option<String>,
    partial: String,
}

impl SimulatedSynthesizer {
    /// Synthesizer at `gpib_address`, output on at 100 MHz and 0 dBm.
    pub fn new(gpib_address: u8) -> Self {
        Self {
            gpib_address,
            adapter_address: None,
            mode: None,
            auto_read: None,
            frequency: 100e6,
            power: 0.0,
            output_enabled: true,
            set_commands: 0,
            pending: None,
            partial: String::new(),
        }
    }

    fn handle_line(&mut self, line: &str) -> Option<String> {
        if let Some(option) = line.strip_prefix("++") {
            let mut parts = option.split_whitespace();
            let key = parts.next()?;
            let value = parts.next().and_then(|v| v.parse::<u8>().ok());
            match key {
                "mode" => self.mode = value,
                "auto" => self.auto_read = value,
                "addr" => self.adapter_address = value,
                "read" => return self.pending.take().map(|r| format!("{}\n", r)),
                _ => {}
            }
            return None;
        }
        if self.adapter_address != Some(self.gpib_address) {
            return None;
        }
        let (command, argument) = match line.split_once(' ') {
            Some((c, a)) => (c, Some(a.trim())),
            None => (line, None),
        };
        let number = |arg: Option<&str>| -> Option<f64> {
            arg?.split_whitespace().next()?.parse::<f64>().ok()
        };
        match command {
            ":POWer:STATe?" => self.pending = Some(u8::from(self.output_enabled).to_string()),
            ":FREQuency:CW?" => self.pending = Some(format!("{:+.10E}", self.frequency)),
            ":POWer:LEVel?" => self.pending = Some(format!("{:+.8E}", self.power)),
            ":POWer:STATe" => {
                self.set_commands += 1;
                self.output_enabled = number(argument).map(|v| v != 0.0).unwrap_or(false);
            }
            ":FREQuency:CW" => {
                self.set_commands += 1;
                if let Some(f) = number(argument) {
                    self.frequency = f;
                }
            }
            ":POWer:LEVel" => {
                self.set_commands += 1;
                if let Some(p) = number(argument) {
                    self.power = p;
                }
            }
            _ => {}
        }
        None
    }
}

impl SimulatedDevice for SimulatedSynthesizer {
    fn on_write(&mut self, data: &[u8]) -> Vec<u8> {
        self.partial.push_str(&String::from_utf8_lossy(data));
        let mut output = Vec::new();
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            if let Some(reply) = self.handle_line(line.trim()) {
                output.extend_from_slice(reply.as_bytes());
            }
        }
        output
    }
}

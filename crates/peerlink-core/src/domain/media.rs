//! Media configuration, device catalog, and the negotiation rules that pick a
//! configuration both the input and the output device can run.
//!
//! Pure data, no I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Buffer sizes (in frames) a session may use.
pub const BUFFER_SIZES: [u32; 4] = [64, 128, 256, 512];

// ---------------------------------------------------------------------------
// MediaConfig
// ---------------------------------------------------------------------------

/// Audio configuration a session is created with and both engines must accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfig {
    pub host: String,
    pub input_device: String,
    pub output_device: String,
    pub sample_rate: u32,
    /// Frames per buffer, one of [`BUFFER_SIZES`].
    pub buffer_size: u32,
    pub stereo: bool,
    /// First input channel; must be even when `stereo` is set.
    pub input_channel: u32,
    /// First output channel; must be even when `stereo` is set.
    pub output_channel: u32,
}

impl MediaConfig {
    pub fn channel_count(&self) -> u32 {
        if self.stereo {
            2
        } else {
            1
        }
    }

    /// Checks this config against a local catalog.
    ///
    /// Returns the first violated rule. The engine performs the authoritative
    /// check against real hardware; this one catches mistakes before a
    /// round-trip.
    pub fn validate_against(&self, catalog: &DeviceCatalog) -> Result<(), ConfigIssue> {
        let input = &catalog.device(&self.host, &self.input_device)?.input;
        let output = &catalog.device(&self.host, &self.output_device)?.output;

        if !compatible_sample_rates(input, output).contains(&self.sample_rate) {
            return Err(ConfigIssue::SampleRateUnsupported(self.sample_rate));
        }
        if !BUFFER_SIZES.contains(&self.buffer_size) {
            return Err(ConfigIssue::BufferSizeNotAllowed(self.buffer_size));
        }
        if !compatible_buffer_sizes(input, output).contains(&self.buffer_size) {
            return Err(ConfigIssue::BufferSizeOutOfRange(self.buffer_size));
        }
        self.check_channel(self.input_channel, input.channels)?;
        self.check_channel(self.output_channel, output.channels)?;
        Ok(())
    }

    fn check_channel(&self, channel: u32, available: u16) -> Result<(), ConfigIssue> {
        if self.stereo && channel % 2 != 0 {
            return Err(ConfigIssue::OddStereoChannel(channel));
        }
        let past_end = channel
            .checked_add(self.channel_count())
            .map_or(true, |end| end > u32::from(available));
        if past_end {
            return Err(ConfigIssue::ChannelOutOfRange { channel, available });
        }
        Ok(())
    }
}

/// Which half of a session the engine plays when streaming starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamDirection {
    /// Capture from the input device and transmit to the remote endpoint.
    Send,
    /// Receive from the remote endpoint and play on the output device.
    Return,
}

/// Why a [`MediaConfig`] does not fit a [`DeviceCatalog`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigIssue {
    #[error("unknown audio host {0:?}")]
    UnknownHost(String),
    #[error("unknown device {0:?}")]
    UnknownDevice(String),
    #[error("sample rate {0} is not supported by both devices")]
    SampleRateUnsupported(u32),
    #[error("buffer size {0} is not a supported power of two")]
    BufferSizeNotAllowed(u32),
    #[error("buffer size {0} is outside the devices' allowed range")]
    BufferSizeOutOfRange(u32),
    #[error("stereo channel index {0} must be even")]
    OddStereoChannel(u32),
    #[error("channel {channel} exceeds the {available} channels available")]
    ChannelOutOfRange { channel: u32, available: u16 },
}

// ---------------------------------------------------------------------------
// DeviceCatalog
// ---------------------------------------------------------------------------

/// Inclusive buffer-size range a device accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRange {
    pub min: u32,
    pub max: u32,
}

/// Capabilities of one direction (input or output) of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionCaps {
    pub sample_rates: Vec<u32>,
    pub buffer_size: BufferRange,
    pub channels: u16,
}

/// Input and output capabilities of a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub input: DirectionCaps,
    pub output: DirectionCaps,
}

/// host → device → capabilities, as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceCatalog {
    hosts: BTreeMap<String, BTreeMap<String, DeviceCaps>>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, device: impl Into<String>, caps: DeviceCaps) {
        self.hosts
            .entry(host.into())
            .or_default()
            .insert(device.into(), caps);
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn devices(&self, host: &str) -> impl Iterator<Item = (&str, &DeviceCaps)> {
        self.hosts
            .get(host)
            .into_iter()
            .flat_map(|devices| devices.iter().map(|(name, caps)| (name.as_str(), caps)))
    }

    pub fn capabilities(&self, host: &str, device: &str) -> Option<&DeviceCaps> {
        self.hosts.get(host)?.get(device)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    fn device(&self, host: &str, device: &str) -> Result<&DeviceCaps, ConfigIssue> {
        let devices = self
            .hosts
            .get(host)
            .ok_or_else(|| ConfigIssue::UnknownHost(host.to_owned()))?;
        devices
            .get(device)
            .ok_or_else(|| ConfigIssue::UnknownDevice(device.to_owned()))
    }

    /// Picks the first valid config for the given devices: lowest shared
    /// sample rate, smallest shared buffer size, first usable channels.
    ///
    /// Returns `None` when the devices share no rate, no buffer size, or
    /// lack the channels for the requested layout.
    pub fn negotiate(
        &self,
        host: &str,
        input_device: &str,
        output_device: &str,
        stereo: bool,
    ) -> Option<MediaConfig> {
        let input = &self.capabilities(host, input_device)?.input;
        let output = &self.capabilities(host, output_device)?.output;

        let sample_rate = compatible_sample_rates(input, output).into_iter().min()?;
        let buffer_size = compatible_buffer_sizes(input, output).into_iter().next()?;
        let input_channel = channel_choices(input.channels, stereo).into_iter().next()?;
        let output_channel = channel_choices(output.channels, stereo).into_iter().next()?;

        Some(MediaConfig {
            host: host.to_owned(),
            input_device: input_device.to_owned(),
            output_device: output_device.to_owned(),
            sample_rate,
            buffer_size,
            stereo,
            input_channel,
            output_channel,
        })
    }

    /// Negotiates against the first host and the first devices that have
    /// input and output channels respectively.
    pub fn negotiate_default(&self, stereo: bool) -> Option<MediaConfig> {
        self.hosts().find_map(|host| {
            let input = self
                .devices(host)
                .find(|(_, caps)| caps.input.channels > 0)?
                .0;
            let output = self
                .devices(host)
                .find(|(_, caps)| caps.output.channels > 0)?
                .0;
            self.negotiate(host, input, output, stereo)
        })
    }
}

// ---------------------------------------------------------------------------
// Negotiation rules
// ---------------------------------------------------------------------------

/// Input rates also supported by the output, in the input's order.
pub fn compatible_sample_rates(input: &DirectionCaps, output: &DirectionCaps) -> Vec<u32> {
    input
        .sample_rates
        .iter()
        .copied()
        .filter(|rate| output.sample_rates.contains(rate))
        .collect()
}

/// Members of [`BUFFER_SIZES`] inside both devices' ranges.
pub fn compatible_buffer_sizes(input: &DirectionCaps, output: &DirectionCaps) -> Vec<u32> {
    let min = input.buffer_size.min.max(output.buffer_size.min);
    let max = input.buffer_size.max.min(output.buffer_size.max);
    BUFFER_SIZES
        .into_iter()
        .filter(|size| (min..=max).contains(size))
        .collect()
}

/// First-channel indices usable on a device with `channels` channels.
///
/// Stereo pairs start on even indices and need room for both channels.
pub fn channel_choices(channels: u16, stereo: bool) -> Vec<u32> {
    let channels = u32::from(channels);
    if stereo {
        (0..channels).step_by(2).filter(|c| c + 2 <= channels).collect()
    } else {
        (0..channels).collect()
    }
}

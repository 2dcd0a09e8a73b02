use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::buffer::{AllocationMode, BufferUsage, FieldParity};
use crate::channel::ChannelSettings;
use crate::pool::{MAX_CAPACITY, MIN_CAPACITY};
use crate::source::SourceSettings;
use crate::submit::SubmitFailurePolicy;

const DEFAULT_DEVICE_ID: u32 = 0;
const DEFAULT_BUFFER_COUNT: usize = 6;
const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_FORMAT: &str = "NV12";

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device_id: Option<u32>,
    io_mode: Option<String>,
    buffer_count: Option<usize>,
    buffer_usage: Option<String>,
    /// Negative means unlimited.
    num_buffers: Option<i64>,
    do_timestamp: Option<bool>,
    live: Option<bool>,
    print_fps: Option<bool>,
    async_start: Option<bool>,
    submit_failure: Option<String>,
    channels: Option<Vec<ChannelConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ChannelConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    format: Option<String>,
    field: Option<String>,
    frame_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_id: u32,
    pub io_mode: AllocationMode,
    pub buffer_count: usize,
    pub buffer_usage: BufferUsage,
    pub num_buffers: Option<u64>,
    pub do_timestamp: bool,
    pub live: bool,
    pub print_fps: bool,
    pub async_start: bool,
    pub submit_failure: SubmitFailurePolicy,
    /// The first entry describes the primary channel.
    pub channels: Vec<ChannelSettings>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID,
            io_mode: AllocationMode::SelfAllocated,
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_usage: BufferUsage::None,
            num_buffers: None,
            do_timestamp: false,
            live: true,
            print_fps: false,
            async_start: false,
            submit_failure: SubmitFailurePolicy::Drop,
            channels: vec![default_channel()],
        }
    }
}

impl CaptureConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let io_mode = match file.io_mode.as_deref() {
            Some(mode) => parse_io_mode(mode)?,
            None => AllocationMode::SelfAllocated,
        };
        let buffer_usage = match file.buffer_usage.as_deref() {
            Some(usage) => BufferUsage::parse(usage)
                .ok_or_else(|| anyhow!("unknown buffer_usage {:?}", usage))?,
            None => BufferUsage::None,
        };
        let submit_failure = match file.submit_failure.as_deref() {
            Some(policy) => parse_submit_failure(policy)?,
            None => SubmitFailurePolicy::Drop,
        };
        let channels = match file.channels {
            Some(entries) if !entries.is_empty() => entries
                .into_iter()
                .map(channel_from_file)
                .collect::<Result<Vec<_>>>()?,
            _ => vec![default_channel()],
        };
        Ok(Self {
            device_id: file.device_id.unwrap_or(DEFAULT_DEVICE_ID),
            io_mode,
            buffer_count: file.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT),
            buffer_usage,
            num_buffers: file.num_buffers.and_then(|n| u64::try_from(n).ok()),
            do_timestamp: file.do_timestamp.unwrap_or(false),
            live: file.live.unwrap_or(true),
            print_fps: file.print_fps.unwrap_or(false),
            async_start: file.async_start.unwrap_or(false),
            submit_failure,
            channels,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("CAPTURE_IO_MODE") {
            if !mode.trim().is_empty() {
                self.io_mode = parse_io_mode(&mode)?;
            }
        }
        if let Ok(count) = std::env::var("CAPTURE_BUFFER_COUNT") {
            self.buffer_count = count
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAPTURE_BUFFER_COUNT must be an integer"))?;
        }
        if let Ok(limit) = std::env::var("CAPTURE_NUM_BUFFERS") {
            let limit: i64 = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAPTURE_NUM_BUFFERS must be an integer (-1 for unlimited)"))?;
            self.num_buffers = u64::try_from(limit).ok();
        }
        if let Ok(value) = std::env::var("CAPTURE_PRINT_FPS") {
            self.print_fps = parse_bool("CAPTURE_PRINT_FPS", &value)?;
        }
        if let Ok(value) = std::env::var("CAPTURE_DO_TIMESTAMP") {
            self.do_timestamp = parse_bool("CAPTURE_DO_TIMESTAMP", &value)?;
        }
        if let Ok(policy) = std::env::var("CAPTURE_SUBMIT_FAILURE") {
            if !policy.trim().is_empty() {
                self.submit_failure = parse_submit_failure(&policy)?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.buffer_count) {
            return Err(anyhow!(
                "buffer_count must be between {} and {}, got {}",
                MIN_CAPACITY,
                MAX_CAPACITY,
                self.buffer_count
            ));
        }
        for (index, channel) in self.channels.iter().enumerate() {
            channel
                .resolved_frame_size()
                .with_context(|| format!("channel entry {}", index))?;
        }
        Ok(())
    }

    /// Runtime settings for `CaptureSource`, using the first channel entry
    /// as the primary channel.
    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            device_id: self.device_id,
            io_mode: self.io_mode,
            buffer_count: self.buffer_count,
            buffer_usage: self.buffer_usage,
            num_buffers: self.num_buffers,
            do_timestamp: self.do_timestamp,
            live: self.live,
            print_fps: self.print_fps,
            async_start: self.async_start,
            submit_failure: self.submit_failure,
            primary: self.channels.first().cloned().unwrap_or_else(default_channel),
        }
    }

    /// Channel entries after the primary one.
    pub fn secondary_channels(&self) -> &[ChannelSettings] {
        self.channels.get(1..).unwrap_or(&[])
    }
}

fn default_channel() -> ChannelSettings {
    ChannelSettings {
        width: DEFAULT_WIDTH,
        height: DEFAULT_HEIGHT,
        format: DEFAULT_FORMAT.to_string(),
        field: FieldParity::None,
        frame_size: None,
    }
}

fn channel_from_file(file: ChannelConfigFile) -> Result<ChannelSettings> {
    let field = match file.field.as_deref() {
        Some(field) => {
            FieldParity::parse(field).ok_or_else(|| anyhow!("unknown field parity {:?}", field))?
        }
        None => FieldParity::None,
    };
    Ok(ChannelSettings {
        width: file.width.unwrap_or(DEFAULT_WIDTH),
        height: file.height.unwrap_or(DEFAULT_HEIGHT),
        format: file.format.unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
        field,
        frame_size: file.frame_size,
    })
}

fn parse_io_mode(value: &str) -> Result<AllocationMode> {
    AllocationMode::parse(value).ok_or_else(|| {
        anyhow!(
            "unknown io_mode {:?} (expected self_allocated, device_mapped, device_exported or downstream_imported)",
            value
        )
    })
}

fn parse_submit_failure(value: &str) -> Result<SubmitFailurePolicy> {
    SubmitFailurePolicy::parse(value)
        .ok_or_else(|| anyhow!("unknown submit_failure policy {:?} (expected drop or retain)", value))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean, got {:?}", name, value)),
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

use crate::device::{PcmFormat, StreamDirection};
use crate::error::{MonitorError, MonitorResult};
use cpal::traits::DeviceTrait;
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use log::{debug, error, info};

fn is_usable(format: SampleFormat) -> bool {
    format == SampleFormat::F32 || format == SampleFormat::I16
}

fn covers(config: &SupportedStreamConfigRange, rate: u32) -> bool {
    config.min_sample_rate().0 <= rate && config.max_sample_rate().0 >= rate
}

/// Picks a stream config at exactly the requested rate, preferring the requested channel count
/// and f32 over i16. There is no resampling stage, so a device without the rate is rejected.
pub fn find_best_config(
    device: &cpal::Device,
    direction: StreamDirection,
    wanted: &PcmFormat,
) -> MonitorResult<(StreamConfig, SampleFormat)> {
    let supported = match direction {
        StreamDirection::Capture => device.supported_input_configs().map(|c| c.collect::<Vec<_>>()),
        StreamDirection::Playback => device.supported_output_configs().map(|c| c.collect::<Vec<_>>()),
    };
    let supported_configs: Vec<SupportedStreamConfigRange> = match supported {
        Ok(configs) => configs,
        Err(e) => {
            error!("error getting supported {:?} configs : {:?}", direction, e);
            return Err(MonitorError::Device(e.to_string()));
        }
    };
    for config in &supported_configs {
        info!("Supported {:?} config: {:?}", direction, config);
    }

    let rate = wanted.sample_rate;
    let exact = supported_configs
        .iter()
        .filter(|c| c.channels() == wanted.channels && covers(c, rate) && is_usable(c.sample_format()))
        .min_by_key(|c| c.sample_format() != SampleFormat::F32);
    if let Some(config_range) = exact {
        debug!("Found desired configuration ({} Hz, {} channels, {:?})", rate, wanted.channels, config_range.sample_format());
        let config = config_range.with_sample_rate(SampleRate(rate));
        return Ok((config.clone().into(), config_range.sample_format()));
    }

    let any_channels = supported_configs
        .iter()
        .filter(|c| covers(c, rate) && is_usable(c.sample_format()))
        .min_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::F32));
    if let Some(config_range) = any_channels {
        debug!("Found {} Hz configuration with {} channels", rate, config_range.channels());
        let config = config_range.with_sample_rate(SampleRate(rate));
        return Ok((config.clone().into(), config_range.sample_format()));
    }

    Err(MonitorError::Config(format!("Device has no {:?} configuration at {} Hz", direction, rate)))
}

use std::time::Duration;

use crate::audio::{CaptureConstraints, PlaybackParams};
use crate::net_link::ReconnectPolicy;
use crate::outbound::{OverflowPolicy, QueuePolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 网络配置（静态部分）
    pub ws_url: &'static str,
    pub ws_token: &'static str,

    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,
    pub client_id: String,

    // 重连策略
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,

    // 断线期间的发送队列
    pub outbound_queue_capacity: usize,
    pub outbound_overflow: OverflowPolicy,

    // 麦克风
    pub capture_device: &'static str,
    pub capture_sample_rate: u32,
    pub capture_channels: u32,
    pub capture_chunk_ms: u32,
    pub capture_echo_cancellation: bool,
    pub capture_noise_suppression: bool,
    pub capture_auto_gain: bool,

    // 扬声器
    pub playback_device: &'static str,
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
    pub playback_period_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            ws_url: env!("WS_URL"),
            ws_token: env!("WS_TOKEN"),

            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),

            reconnect_base_delay_ms: env!("RECONNECT_BASE_DELAY_MS")
                .parse()
                .map_err(|_| "Failed to parse RECONNECT_BASE_DELAY_MS")?,
            reconnect_max_attempts: env!("RECONNECT_MAX_ATTEMPTS")
                .parse()
                .map_err(|_| "Failed to parse RECONNECT_MAX_ATTEMPTS")?,

            outbound_queue_capacity: env!("OUTBOUND_QUEUE_CAPACITY")
                .parse()
                .map_err(|_| "Failed to parse OUTBOUND_QUEUE_CAPACITY")?,
            outbound_overflow: env!("OUTBOUND_OVERFLOW")
                .parse()
                .map_err(|_| "Failed to parse OUTBOUND_OVERFLOW")?,

            capture_device: env!("CAPTURE_DEVICE"),
            capture_sample_rate: env!("CAPTURE_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse CAPTURE_SAMPLE_RATE")?,
            capture_channels: env!("CAPTURE_CHANNELS")
                .parse()
                .map_err(|_| "Failed to parse CAPTURE_CHANNELS")?,
            capture_chunk_ms: env!("CAPTURE_CHUNK_MS")
                .parse()
                .map_err(|_| "Failed to parse CAPTURE_CHUNK_MS")?,
            capture_echo_cancellation: env!("CAPTURE_ECHO_CANCELLATION")
                .parse()
                .map_err(|_| "Failed to parse CAPTURE_ECHO_CANCELLATION")?,
            capture_noise_suppression: env!("CAPTURE_NOISE_SUPPRESSION")
                .parse()
                .map_err(|_| "Failed to parse CAPTURE_NOISE_SUPPRESSION")?,
            capture_auto_gain: env!("CAPTURE_AUTO_GAIN")
                .parse()
                .map_err(|_| "Failed to parse CAPTURE_AUTO_GAIN")?,

            playback_device: env!("PLAYBACK_DEVICE"),
            playback_sample_rate: env!("PLAYBACK_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse PLAYBACK_SAMPLE_RATE")?,
            playback_channels: env!("PLAYBACK_CHANNELS")
                .parse()
                .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE")
                .parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            capacity: self.outbound_queue_capacity,
            overflow: self.outbound_overflow,
        }
    }

    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: self.capture_sample_rate,
            channels: self.capture_channels,
            chunk_ms: self.capture_chunk_ms,
            echo_cancellation: self.capture_echo_cancellation,
            noise_suppression: self.capture_noise_suppression,
            auto_gain: self.capture_auto_gain,
        }
    }

    pub fn playback_params(&self) -> PlaybackParams {
        PlaybackParams {
            sample_rate: self.playback_sample_rate,
            channels: self.playback_channels,
            period_size: self.playback_period_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_config_parses() {
        let config = Config::new().expect("config.toml should be valid");
        assert!(config.ws_url.starts_with("ws"));
        assert!(config.capture_chunk_ms > 0);
        assert!(config.reconnect_policy().max_attempts > 0);
    }

    #[test]
    fn capture_constraints_carry_processing_flags() {
        let config = Config::new().unwrap();
        let constraints = config.capture_constraints();
        assert_eq!(constraints.sample_rate, config.capture_sample_rate);
        assert_eq!(constraints.echo_cancellation, config.capture_echo_cancellation);
        assert_eq!(constraints.auto_gain, config.capture_auto_gain);
    }
}

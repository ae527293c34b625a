use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    reconnect: Reconnect,
    outbound: Outbound,
    capture: Capture,
    playback: Playback,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    device_id: String,
    client_id: String,
}

#[derive(Deserialize)]
struct Reconnect {
    base_delay_ms: u64,
    max_attempts: u32,
}

#[derive(Deserialize)]
struct Outbound {
    queue_capacity: usize,
    overflow: String,
}

#[derive(Deserialize)]
struct Capture {
    device: String,
    sample_rate: u32,
    channels: u32,
    chunk_ms: u32,
    echo_cancellation: bool,
    noise_suppression: bool,
    auto_gain: bool,
}

#[derive(Deserialize)]
struct Playback {
    device: String,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);

    // 重连策略
    println!("cargo:rustc-env=RECONNECT_BASE_DELAY_MS={}", config.reconnect.base_delay_ms);
    println!("cargo:rustc-env=RECONNECT_MAX_ATTEMPTS={}", config.reconnect.max_attempts);

    // 发送队列
    println!("cargo:rustc-env=OUTBOUND_QUEUE_CAPACITY={}", config.outbound.queue_capacity);
    println!("cargo:rustc-env=OUTBOUND_OVERFLOW={}", config.outbound.overflow);

    // 采集配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.capture.device);
    println!("cargo:rustc-env=CAPTURE_SAMPLE_RATE={}", config.capture.sample_rate);
    println!("cargo:rustc-env=CAPTURE_CHANNELS={}", config.capture.channels);
    println!("cargo:rustc-env=CAPTURE_CHUNK_MS={}", config.capture.chunk_ms);
    println!("cargo:rustc-env=CAPTURE_ECHO_CANCELLATION={}", config.capture.echo_cancellation);
    println!("cargo:rustc-env=CAPTURE_NOISE_SUPPRESSION={}", config.capture.noise_suppression);
    println!("cargo:rustc-env=CAPTURE_AUTO_GAIN={}", config.capture.auto_gain);

    // 播放配置
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.playback.device);
    println!("cargo:rustc-env=PLAYBACK_SAMPLE_RATE={}", config.playback.sample_rate);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.playback.channels);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.playback.period_size);
}

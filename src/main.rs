use std::sync::Arc;

use tokio::signal;
use uuid::Uuid;

use voicelink::audio::{CapturePipeline, Microphone, OutputFactory, PlaybackScheduler};
use voicelink::config::Config;
use voicelink::net_link::{NetEvent, NetLink, WsConnector};
use voicelink::protocol::INTENTIONAL_CLOSE_CODE;

/// 客户端UUID持久化文件，保持重启间身份一致
const CLIENT_ID_FILE: &str = "voicelink_uuid.txt";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    resolve_client_id(&mut config);
    log::info!("{} v{} starting", config.app_name, config.app_version);

    let (microphone, output) = audio_backend(&config)?;

    // 启动网络链接，播放调度归它所有
    let connector = Arc::new(WsConnector::from_config(&config));
    let playback = PlaybackScheduler::new(output);
    let (link, handle, mut events) = NetLink::new(
        connector,
        playback,
        config.reconnect_policy(),
        config.queue_policy(),
    );
    let link_task = tokio::spawn(link.run());

    let mut capture = CapturePipeline::new(microphone, config.capture_constraints(), handle.clone());

    // 首次连接失败时链接会自己重试，Connected 事件到来后再开始发送
    if let Err(e) = handle.connect().await {
        log::error!("Initial connect failed: {}", e);
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    log::warn!("Network link stopped unexpectedly");
                    break;
                };
                match event {
                    NetEvent::Connected => {
                        if !capture.is_transmitting() {
                            if let Err(e) = capture.start_transmission() {
                                log::error!("Cannot start transmission: {}", e);
                            }
                        }
                    }
                    NetEvent::Disconnected { code, reconnecting } => {
                        if reconnecting {
                            log::warn!("Disconnected (code {}), frames will queue", code);
                        } else {
                            log::error!("Disconnected for good (code {})", code);
                            capture.stop_transmission();
                            capture.stop_recording();
                        }
                    }
                    NetEvent::ReconnectScheduled { attempt, delay } => {
                        log::info!("Reconnect attempt {} in {:?}", attempt, delay);
                    }
                    NetEvent::State(state) => log::info!("Server state: {}", state),
                    NetEvent::AudioRejected(reason) => log::warn!("Server audio rejected: {}", reason),
                    NetEvent::Other(value) => log::info!("Server message: {}", value),
                }
            }
        }
    }

    capture.stop_transmission();
    capture.stop_recording();
    handle.close(INTENTIONAL_CLOSE_CODE, "client shutdown").await;
    handle.shutdown();
    if let Err(e) = link_task.await {
        log::error!("Network link task failed: {}", e);
    }
    Ok(())
}

/// 先从本地文件读取，不存在则生成新的并保存
fn resolve_client_id(config: &mut Config) {
    if config.client_id != "unknown-client" {
        return;
    }
    if let Ok(content) = std::fs::read_to_string(CLIENT_ID_FILE) {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            config.client_id = trimmed.to_string();
            log::info!("Loaded Client ID from file: {}", config.client_id);
            return;
        }
    }

    config.client_id = Uuid::new_v4().to_string();
    log::info!("Generated new Client ID: {}", config.client_id);
    if let Err(e) = std::fs::write(CLIENT_ID_FILE, &config.client_id) {
        log::warn!("Failed to save Client ID to file: {}", e);
    }
}

#[cfg(feature = "alsa")]
fn audio_backend(config: &Config) -> anyhow::Result<(Arc<dyn Microphone>, Box<dyn OutputFactory>)> {
    use voicelink::audio::{AlsaMicrophone, AlsaOutputFactory};

    Ok((
        Arc::new(AlsaMicrophone::new(config.capture_device)),
        Box::new(AlsaOutputFactory::new(config.playback_device, config.playback_params())),
    ))
}

#[cfg(not(feature = "alsa"))]
fn audio_backend(_config: &Config) -> anyhow::Result<(Arc<dyn Microphone>, Box<dyn OutputFactory>)> {
    anyhow::bail!("built without an audio backend, rebuild with `--features alsa`")
}

//! 子命令实现

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use gattlink_core::ble::transport::{BleTransport, TransportEvents};
use gattlink_core::{
    AllowAll, BtleplugTransport, LinkConfig, LinkError, LinkState, MockTransport, ScanStart,
    SessionEvent, SessionFacade,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const NOTIFY_GRACE: Duration = Duration::from_secs(1);

async fn open_transport(simulate: bool) -> Result<(Arc<dyn BleTransport>, TransportEvents)> {
    if simulate {
        tracing::info!("Using simulated peripheral");
        let (mock, events) = MockTransport::echo_peripheral().into_shared();
        let transport: Arc<dyn BleTransport> = mock;
        return Ok((transport, events));
    }
    let (transport, events) = BtleplugTransport::new()
        .await
        .context("无法打开蓝牙适配器")?;
    Ok((Arc::new(transport), events))
}

/// 按地址连接：先扫描查找，不要求设备广播名称
async fn open_for_address(simulate: bool, mut config: LinkConfig) -> Result<(SessionFacade, Duration)> {
    config.scan.require_name = false;
    let scan_timeout = config.scan.timeout();
    Ok((open_facade(simulate, config).await?, scan_timeout))
}

async fn open_facade(simulate: bool, config: LinkConfig) -> Result<SessionFacade> {
    let (transport, events) = open_transport(simulate).await?;
    Ok(SessionFacade::new(
        transport,
        events,
        Arc::new(AllowAll),
        config,
    ))
}

/// 查找设备、连接并等待会话就绪
async fn connect_ready(facade: &SessionFacade, address: &str, scan_timeout: Duration) -> Result<()> {
    println!("🔍 正在查找 {}...", address);
    let device = match facade.find_device(address, scan_timeout).await {
        Ok(device) => device,
        Err(LinkError::DeviceNotFound(_)) => bail!(
            "扫描 {}s 未发现设备 {}",
            scan_timeout.as_secs(),
            address
        ),
        Err(e) => return Err(e).context("扫描失败"),
    };

    let mut state = facade.observe_state();
    facade
        .connect(device)
        .await
        .with_context(|| format!("连接 {} 失败", address))?;

    let status = timeout(
        CONNECT_TIMEOUT,
        state.wait_for(|s| {
            matches!(
                s.link,
                LinkState::Ready | LinkState::Failed | LinkState::Disconnected
            )
        }),
    )
    .await
    .context("连接超时")??
    .clone();

    if status.link != LinkState::Ready {
        bail!("连接 {} 失败 (状态: {})", address, status.link);
    }

    // 通知在 Ready 之后才启用
    let _ = timeout(NOTIFY_GRACE, state.wait_for(|s| s.notifying)).await;
    if !facade.status().notifying {
        tracing::warn!("Notifications not enabled, replies will not be shown");
    }
    Ok(())
}

pub async fn scan(
    simulate: bool,
    config: LinkConfig,
    timeout_secs: Option<u64>,
    json: bool,
) -> Result<()> {
    let duration = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.scan.timeout());
    let facade = open_facade(simulate, config).await?;

    if !json {
        println!("🔍 扫描设备 ({}s)...", duration.as_secs());
    }
    let ScanStart::Started(mut stream) = facade.scan_for(duration).await? else {
        bail!("扫描已停止");
    };
    let mut index = 0;
    while let Some(device) = stream.next().await {
        if !json {
            println!(
                "   [{}] {} ({})",
                index,
                device.display_name(),
                device.address
            );
        }
        index += 1;
    }

    let devices = facade.devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("   未发现设备");
    }
    Ok(())
}

pub async fn send(
    simulate: bool,
    config: LinkConfig,
    address: &str,
    message: &str,
    wait_secs: u64,
) -> Result<()> {
    if message.is_empty() {
        bail!("请输入要发送的消息");
    }
    let (facade, scan_timeout) = open_for_address(simulate, config).await?;
    connect_ready(&facade, address, scan_timeout).await?;

    let mut inbound = facade.observe_inbound();
    facade.send_text(message).await.context("发送失败")?;
    println!("📤 已发送 {} 字节", message.len());

    if wait_secs > 0 {
        match timeout(Duration::from_secs(wait_secs), inbound.next()).await {
            Ok(Some(reply)) => println!("📥 {}", reply.text()),
            _ => println!("   未收到回复"),
        }
    }

    facade.disconnect().await?;
    Ok(())
}

pub async fn chat(simulate: bool, config: LinkConfig, address: &str) -> Result<()> {
    let (facade, scan_timeout) = open_for_address(simulate, config).await?;
    connect_ready(&facade, address, scan_timeout).await?;
    println!("💬 已连接 {}，输入 /quit 退出", address);

    let mut events = facade.observe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Inbound(message) => println!("📥 {}", message.text()),
                SessionEvent::Disconnected { address } => {
                    println!("⚠️  {} 已断开", address);
                    break;
                }
                SessionEvent::Failed(e) | SessionEvent::Degraded(e) => {
                    println!("⚠️  {}", e)
                }
                _ => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = facade.send_text(line).await {
            println!("❌ 发送失败: {}", e);
            if facade.status().link != LinkState::Ready {
                break;
            }
        }
    }

    facade.disconnect().await?;
    printer.abort();
    Ok(())
}

pub fn config(config: LinkConfig, init: bool) -> Result<()> {
    if init {
        let path = LinkConfig::default().save()?;
        println!("已写入默认配置: {}", path.display());
        return Ok(());
    }
    println!("# {}", LinkConfig::config_path().display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_rejects_empty_message() {
        let err = send(true, LinkConfig::default(), "C0:FF:EE:00:00:01", "", 0)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "请输入要发送的消息");
    }

    #[tokio::test]
    async fn test_send_scans_before_connecting() {
        // 地址大小写不敏感
        send(true, LinkConfig::default(), "c0:ff:ee:00:00:01", "hi", 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_finds_unnamed_device() {
        send(true, LinkConfig::default(), "C0:FF:EE:00:00:02", "hi", 0)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_unknown_address() {
        let err = send(true, LinkConfig::default(), "AA:BB:CC:DD:EE:FF", "hi", 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("未发现设备 AA:BB:CC:DD:EE:FF"));
    }
}

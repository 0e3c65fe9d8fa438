/// 远端摄像头监控 (无界面版)
///
/// 连接控制通道 → 启动每路接收线程 → 每秒打印一次流量/帧率/丢帧
///
/// 主程序入口 - 直接运行: cargo run --bin dashboard --release -- --remote-ip 10.74.7.14
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use camfeed_rs::config::{
    CameraSettings, LinkSettings, ReconnectTrigger, StreamPreset, MAX_CAMERAS,
};
use camfeed_rs::{gen_time_string, Session};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use log::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "远端摄像头监控", long_about = None)]
struct Args {
    /// 远端地址
    #[arg(short, long, default_value = "10.74.7.14")]
    remote_ip: IpAddr,

    /// 摄像头数量
    #[arg(
        short,
        long,
        default_value_t = 2,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..=MAX_CAMERAS as u64)
    )]
    cameras: usize,

    /// 配置文件
    #[arg(long, default_value = "configs.json")]
    config: String,

    /// 解码输出宽度 (0 = 原尺寸)
    #[arg(short, long, default_value_t = 960)]
    width: u32,

    /// 控制连接本地端口 (0 = 系统分配, 与 feed_sim 同机运行时必须用 0)
    #[arg(long, default_value_t = 5800)]
    local_port: u16,

    /// UDP超时不触发重连
    #[arg(long)]
    no_udp_reconnect: bool,

    /// 启动时对所有摄像头应用的预设 (如 TrafficModerate)
    #[arg(long)]
    preset: Option<String>,

    /// 启动时对所有摄像头设置的分辨率
    #[arg(long)]
    resolution: Option<u32>,

    /// 启动时对所有摄像头设置的JPEG质量
    #[arg(long)]
    quality: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = LinkSettings {
        remote_ip: args.remote_ip,
        local_control_port: (args.local_port != 0).then_some(args.local_port),
        reconnect_trigger: if args.no_udp_reconnect {
            ReconnectTrigger::Never
        } else {
            ReconnectTrigger::UdpTimeout
        },
        decode_width: args.width,
        config_path: args.config.clone(),
        ..LinkSettings::default()
    };

    info!("📹 远端: {}:{}", settings.remote_ip, settings.control_port);
    info!("🎯 摄像头: {} 路 | 解码宽度 {}", args.cameras, settings.decode_width);

    let backoff = settings.reconnect_backoff;
    let mut session = Session::new(settings, args.cameras);
    session.install_signal_handler().context("安装信号处理失败")?;
    let stop = session.stop_flag();

    // ========== 首次连接 ==========
    loop {
        if stop.load(Ordering::Relaxed) {
            session.shutdown()?;
            return Ok(());
        }
        if session.connect_remote()? {
            break;
        }
        warn!("⚠️  连接失败, {:?} 后重试", backoff);
        thread::sleep(backoff);
    }

    apply_startup_overrides(&session, &args)?;

    // ========== 主循环: 取帧 + 打印状态 ==========
    let frames = session.frames();
    let mut frame_count = vec![0u64; args.cameras];
    let mut last_report = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        match frames.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                if let Some(n) = frame_count.get_mut(event.frame.camera_id) {
                    *n += 1;
                }
                log::debug!(
                    "摄像头{} 帧#{} {}x{} | 延迟 {:.2}ms (远端 {:.2}ms, 本地 {:.2}ms)",
                    event.frame.camera_id,
                    event.frame.frame_id,
                    event.frame.image.width,
                    event.frame.image.height,
                    event.latency.total_ms,
                    event.latency.server_ms,
                    event.latency.client_ms,
                );
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            print_status(&session, &frame_count);
        }
    }

    info!("🛑 正在关闭...");
    session.shutdown()?;
    info!("✅ 已退出");
    Ok(())
}

/// 命令行给出的预设或参数, 连接后推送给每路摄像头
fn apply_startup_overrides(session: &Session, args: &Args) -> anyhow::Result<()> {
    if let Some(name) = &args.preset {
        let preset = StreamPreset::from_name(name)
            .with_context(|| format!("未知预设: {}", name))?;
        for camera_id in 0..args.cameras {
            session.apply_preset(camera_id, preset)?;
        }
        info!("🎛️  已应用预设: {}", preset.name());
    }

    if args.resolution.is_some() || args.quality.is_some() {
        let configs = session.control().configs();
        for camera_id in 0..args.cameras {
            let current = configs
                .get(&camfeed_rs::config::camera_key(camera_id))
                .copied()
                .unwrap_or_default();
            let settings = CameraSettings::new(
                args.resolution.unwrap_or(current.resolution),
                args.quality.unwrap_or(current.quality),
            );
            session.update_config(camera_id, settings)?;
        }
    }
    Ok(())
}

fn print_status(session: &Session, frame_count: &[u64]) {
    let status = session.status();
    let link = if status.is_reconnecting() {
        format!("🔄 重连中 (第{}次)", status.reconnect_attempts)
    } else {
        format!("{:?}", status.link_state)
    };

    info!(
        "[{}] {} | 总流量 {:.1} KB/s | 平均帧率 {:.1} | 平均丢帧 {:.1}/s",
        gen_time_string(":"),
        link,
        status.totals.traffic / 1024.0,
        status.totals.fps,
        status.totals.drop_rate,
    );
    for (camera_id, stats) in status.cameras.iter().enumerate() {
        info!(
            "  摄像头{}: {:.1} KB/s | {:.1} fps | 丢帧 {:.1}/s | 累计 {} 帧",
            camera_id,
            stats.traffic / 1024.0,
            stats.fps,
            stats.drop_rate,
            frame_count.get(camera_id).copied().unwrap_or(0),
        );
    }
}

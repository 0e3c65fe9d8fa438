/// 远端编码器模拟
///
/// 1. 监听控制端口, 完成服务端握手, 接收 `JSON|` 配置
/// 2. 每路摄像头按配置的分辨率/质量编码一帧渐变图, 分包发到 `客户端:5801+i`
/// 3. 可选人为丢包, 用来观察丢帧统计
///
/// 主程序入口 - 直接运行: cargo run --bin feed_sim --release -- --loss 5
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use camfeed_rs::assembler::unix_now;
use camfeed_rs::config::{
    camera_key, default_configs, CameraConfigs, CameraSettings, MAX_CAMERAS,
};
use camfeed_rs::control::{GREETING_LEN, MESSAGE_TERMINATOR};
use camfeed_rs::wire::{encode_frame, MAX_PAYLOAD};
use clap::Parser;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;

/// 控制连接心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "远端编码器模拟", long_about = None)]
struct Args {
    /// 控制端口监听地址
    #[arg(short, long, default_value = "0.0.0.0:5800")]
    listen: SocketAddr,

    /// UDP基础端口 (摄像头i → base+i)
    #[arg(long, default_value_t = 5801)]
    udp_base_port: u16,

    /// 摄像头数量
    #[arg(
        short,
        long,
        default_value_t = 2,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..=MAX_CAMERAS as u64)
    )]
    cameras: usize,

    /// 每路帧率
    #[arg(short, long, default_value_t = 15.0)]
    fps: f64,

    /// 人为丢包百分比 (0-100)
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
}

/// 所有线程共享的模拟器状态
struct SimState {
    configs: Mutex<CameraConfigs>,
    client: Mutex<Option<IpAddr>>,
    stop: Arc<AtomicBool>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let state = Arc::new(SimState {
        configs: Mutex::new(default_configs(args.cameras)),
        client: Mutex::new(None),
        stop,
    });

    // ========== 每路摄像头一个推流线程 ==========
    let mut handles = Vec::with_capacity(args.cameras);
    for camera_id in 0..args.cameras {
        let state = Arc::clone(&state);
        let port = u16::try_from(camera_id)
            .ok()
            .and_then(|offset| args.udp_base_port.checked_add(offset))
            .with_context(|| format!("摄像头{} 的UDP端口超出范围", camera_id))?;
        let (fps, loss) = (args.fps, args.loss);
        let handle = thread::Builder::new()
            .name(format!("stream-{}", camera_id))
            .spawn(move || {
                if let Err(e) = stream_camera(&state, camera_id, port, fps, loss) {
                    error!("❌ 摄像头{} 推流失败: {:#}", camera_id, e);
                }
            })?;
        handles.push(handle);
    }

    // ========== 控制端口 ==========
    let listener =
        TcpListener::bind(args.listen).with_context(|| format!("监听 {} 失败", args.listen))?;
    listener.set_nonblocking(true)?;
    info!("🎬 控制端口已监听 {}", args.listen);

    while !state.stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("✅ 客户端已连接: {}", peer);
                *state.client.lock() = Some(peer.ip());
                let state = Arc::clone(&state);
                thread::Builder::new()
                    .name("control".to_string())
                    .spawn(move || {
                        if let Err(e) = serve_control(stream, &state) {
                            warn!("⚠️  控制连接结束: {:#}", e);
                        }
                    })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => error!("❌ accept 失败: {}", e),
        }
    }

    info!("🛑 正在关闭...");
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

/// 服务端握手 + 读取配置, 直到对端关闭
fn serve_control(mut stream: TcpStream, state: &SimState) -> anyhow::Result<()> {
    stream.set_nonblocking(false)?;
    stream.write_all(&[0u8; GREETING_LEN])?;

    let mut stamps = [0u8; 16];
    stream.read_exact(&mut stamps)?;
    let mut t1 = [0u8; 8];
    t1.copy_from_slice(&stamps[..8]);
    let offset = unix_now() - f64::from_be_bytes(t1);
    info!("⏱️  握手完成, 时钟差 {:.3}ms", offset * 1000.0);

    stream.set_read_timeout(Some(Duration::from_millis(200)))?;
    let mut pending = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut last_heartbeat: Option<Instant> = None;
    while !state.stop.load(Ordering::Relaxed) {
        // 客户端探测会消费字节, 心跳间隔需小于其探测超时
        if last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL) {
            stream.write_all(&[0u8])?;
            last_heartbeat = Some(Instant::now());
        }
        let n = match stream.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => return Err(e.into()),
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(end) = pending.iter().position(|&b| b == MESSAGE_TERMINATOR) {
            let message: Vec<u8> = pending.drain(..=end).collect();
            apply_configs(&message[..end], state);
        }
    }
    Ok(())
}

fn apply_configs(message: &[u8], state: &SimState) {
    match serde_json::from_slice::<CameraConfigs>(message) {
        Ok(received) => {
            let mut configs = state.configs.lock();
            for (key, settings) in received {
                info!(
                    "🎛️  {} → 分辨率 {} 质量 {}",
                    key, settings.resolution, settings.quality
                );
                configs.insert(key, settings.clamped());
            }
        }
        Err(e) => warn!("⚠️  无法解析配置 ({} 字节): {}", message.len(), e),
    }
}

fn stream_camera(
    state: &SimState,
    camera_id: usize,
    port: u16,
    fps: f64,
    loss: f64,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let interval = Duration::from_secs_f64(1.0 / fps.max(0.1));
    let loss = (loss / 100.0).clamp(0.0, 1.0);
    let mut rng = rand::thread_rng();
    let mut frame_id: u32 = 0;

    while !state.stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        let client = *state.client.lock();

        if let Some(ip) = client {
            let settings = state
                .configs
                .lock()
                .get(&camera_key(camera_id))
                .copied()
                .unwrap_or_default();

            let capture_ts = unix_now();
            let jpeg = render_frame(camera_id, frame_id, settings)?;
            let server_time = unix_now() - capture_ts;

            frame_id = frame_id.wrapping_add(1);
            let target = SocketAddr::new(ip, port);
            let mut sent = 0usize;
            for datagram in encode_frame(frame_id, capture_ts, server_time, &jpeg, MAX_PAYLOAD) {
                if loss > 0.0 && rng.gen_bool(loss) {
                    continue;
                }
                socket.send_to(&datagram, target)?;
                sent += 1;
            }
            debug!(
                "摄像头{} 帧#{} {} 字节, 发出 {} 个数据报",
                camera_id,
                frame_id,
                jpeg.len(),
                sent
            );
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
    Ok(())
}

/// 4:3 的移动渐变图, 高度 = 分辨率
fn render_frame(camera_id: usize, frame_id: u32, settings: CameraSettings) -> anyhow::Result<Vec<u8>> {
    let height = settings.resolution.max(1);
    let width = (height * 4 / 3).max(1);
    let shift = frame_id.wrapping_mul(4);
    let tint = (camera_id as u32 * 80 % 256) as u8;

    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([
            ((x + shift) % 256) as u8,
            ((y * 255) / height) as u8,
            tint,
        ])
    });

    let mut jpeg = Vec::new();
    let quality = settings.quality.clamp(1, 100) as u8;
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&img)?;
    Ok(jpeg)
}

//! SNTP 时间源

use async_trait::async_trait;
use flux_scene::TimeSource;
use flux_scene_core::{FusionError, Result};
use flux_scene_types::time::epoch_now;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// 1900-01-01 到 1970-01-01 的秒数
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;
const PACKET_LEN: usize = 48;

pub struct SntpTimeSource {
    server: String,
    timeout: Duration,
}

impl SntpTimeSource {
    /// `server` 可带端口，缺省 123
    pub fn new(server: impl Into<String>) -> Self {
        let server = server.into();
        let server = if server.contains(':') { server } else { format!("{server}:123") };
        Self {
            server,
            timeout: Duration::from_secs(5),
        }
    }
}

fn request_packet() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    // LI = 0, VN = 4, Mode = 3 (client)
    packet[0] = 0x23;
    packet
}

fn read_timestamp(buf: &[u8], at: usize) -> f64 {
    let secs = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as f64;
    let frac = u32::from_be_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]) as f64;
    secs + frac / 4_294_967_296.0 - NTP_UNIX_DELTA
}

/// 标准四时间戳偏移：((t1 - t0) + (t2 - t3)) / 2
fn clock_offset(reply: &[u8], sent: f64, received: f64) -> Result<f64> {
    if reply.len() < PACKET_LEN {
        return Err(FusionError::Internal(format!("short NTP reply: {} bytes", reply.len())));
    }
    if reply[0] & 0x07 != 4 {
        return Err(FusionError::Internal("NTP reply is not in server mode".into()));
    }
    let server_received = read_timestamp(reply, 32);
    let server_sent = read_timestamp(reply, 40);
    Ok(((server_received - sent) + (server_sent - received)) / 2.0)
}

#[async_trait]
impl TimeSource for SntpTimeSource {
    async fn offset(&self) -> Result<f64> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| FusionError::Internal(format!("NTP bind failed: {e}")))?;
        socket
            .connect(&self.server)
            .await
            .map_err(|e| FusionError::Internal(format!("NTP connect {} failed: {e}", self.server)))?;

        let sent = epoch_now();
        socket
            .send(&request_packet())
            .await
            .map_err(|e| FusionError::Internal(format!("NTP send failed: {e}")))?;

        let mut buf = [0u8; 512];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| FusionError::Internal(format!("NTP server {} timed out", self.server)))?
            .map_err(|e| FusionError::Internal(format!("NTP receive failed: {e}")))?;
        let received = epoch_now();

        let offset = clock_offset(&buf[..len], sent, received)?;
        debug!(server = %self.server, offset = offset, "NTP offset");
        Ok(offset)
    }
}

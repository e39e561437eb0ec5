//! # Clock Drift
//!
//! Peers compare `last_seen` stamps and KV expiry times taken from their own
//! wall clocks, so a node periodically checks its clock against an SNTP
//! server. The outcome is only logged; a drifting node keeps running.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::NtpConfig;

/// Seconds between the NTP era (1900) and the Unix epoch.
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

const SNTP_PACKET_LEN: usize = 48;

/// LI = 0, VN = 4, Mode = 3 (client).
const SNTP_CLIENT_HEADER: u8 = 0b00_100_011;

/// Something that can measure how far the local clock is off.
#[async_trait]
pub trait ClockCheck: Send + Sync + 'static {
    /// Signed offset in milliseconds (`reference - local`).
    async fn offset_ms(&self) -> Result<i64>;
}

/// Drift outcome against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drift {
    pub offset_ms: i64,
    pub threshold_ms: u64,
}

impl Drift {
    pub fn exceeded(&self) -> bool {
        self.offset_ms.unsigned_abs() > self.threshold_ms
    }
}

/// Queries one SNTP server `checks` times and reports the median offset.
#[derive(Debug, Clone)]
pub struct SntpClock {
    server: String,
    checks: usize,
    timeout: Duration,
}

impl SntpClock {
    pub fn new(config: &NtpConfig) -> Self {
        Self {
            server: config.server.clone(),
            checks: config.checks.max(1),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    async fn query_once(&self) -> Result<i64> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind SNTP socket")?;
        socket
            .connect(&self.server)
            .await
            .with_context(|| format!("resolve {}", self.server))?;

        let mut request = [0u8; SNTP_PACKET_LEN];
        request[0] = SNTP_CLIENT_HEADER;

        let sent_at = unix_millis(SystemTime::now());
        socket.send(&request).await.context("send SNTP request")?;

        let mut response = [0u8; SNTP_PACKET_LEN];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .context("SNTP response timed out")?
            .context("receive SNTP response")?;
        let received_at = unix_millis(SystemTime::now());

        if len < SNTP_PACKET_LEN {
            bail!("short SNTP response ({len} bytes)");
        }
        let server_ms = transmit_timestamp_ms(&response)?;
        let midpoint = sent_at + (received_at - sent_at) / 2;
        Ok(server_ms - midpoint)
    }
}

#[async_trait]
impl ClockCheck for SntpClock {
    async fn offset_ms(&self) -> Result<i64> {
        let mut offsets = Vec::with_capacity(self.checks);
        let mut last_err = None;
        for _ in 0..self.checks {
            match self.query_once().await {
                Ok(offset) => offsets.push(offset),
                Err(e) => last_err = Some(e),
            }
        }
        if offsets.is_empty() {
            return Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no SNTP samples")));
        }
        offsets.sort_unstable();
        Ok(offsets[offsets.len() / 2])
    }
}

/// Run one check and log the outcome.
pub async fn report_drift(check: &dyn ClockCheck, threshold_ms: u64) {
    match check.offset_ms().await {
        Ok(offset_ms) => {
            let drift = Drift { offset_ms, threshold_ms };
            if drift.exceeded() {
                warn!(offset_ms, threshold_ms, "local clock drift exceeds threshold");
            } else {
                debug!(offset_ms, "local clock within drift threshold");
            }
        }
        Err(e) => debug!(error = %e, "clock drift check failed"),
    }
}

fn unix_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Server transmit timestamp (bytes 40..48) as Unix milliseconds.
fn transmit_timestamp_ms(packet: &[u8; SNTP_PACKET_LEN]) -> Result<i64> {
    let secs = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
    let frac = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]) as u64;
    if secs < NTP_UNIX_OFFSET_SECS {
        bail!("SNTP timestamp predates the Unix epoch");
    }
    let millis = (secs - NTP_UNIX_OFFSET_SECS) * 1000 + (frac * 1000 >> 32);
    Ok(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmit_timestamp_decodes() {
        let mut packet = [0u8; SNTP_PACKET_LEN];
        let secs = (NTP_UNIX_OFFSET_SECS + 1_700_000_000) as u32;
        packet[40..44].copy_from_slice(&secs.to_be_bytes());
        packet[44..48].copy_from_slice(&(u32::MAX / 2 + 1).to_be_bytes());
        assert_eq!(transmit_timestamp_ms(&packet).unwrap(), 1_700_000_000_500);
    }

    #[test]
    fn drift_threshold_is_symmetric() {
        let ahead = Drift { offset_ms: 12_000, threshold_ms: 10_000 };
        let behind = Drift { offset_ms: -12_000, threshold_ms: 10_000 };
        let fine = Drift { offset_ms: -300, threshold_ms: 10_000 };
        assert!(ahead.exceeded());
        assert!(behind.exceeded());
        assert!(!fine.exceeded());
    }

    #[tokio::test]
    async fn sntp_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; SNTP_PACKET_LEN];
            while let Ok((_, from)) = server.recv_from(&mut buf).await {
                let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
                let mut reply = [0u8; SNTP_PACKET_LEN];
                reply[0] = 0b00_100_100;
                let secs = (now.as_secs() + NTP_UNIX_OFFSET_SECS) as u32;
                reply[40..44].copy_from_slice(&secs.to_be_bytes());
                let _ = server.send_to(&reply, from).await;
            }
        });

        let clock = SntpClock::new(&NtpConfig {
            server: addr.to_string(),
            checks: 3,
            ..NtpConfig::default()
        });
        let offset = clock.offset_ms().await.unwrap();
        assert!(offset.abs() < 2_000, "offset {offset}ms against a local responder");
    }
}

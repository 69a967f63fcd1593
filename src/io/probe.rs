//! Distance probes - sources of raw ultrasonic readings
//!
//! The echo timing itself happens on a small microcontroller next to each
//! sensor. It writes one reading per line over a serial link:
//! - `123.4` - distance in centimeters
//! - `timeout` (or anything unparseable) - no echo this cycle
//!
//! Reads must stay short. The control loop wraps every read in its own
//! timeout as well, so a stalled port never stalls the loop.

use crate::domain::types::SensorRole;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

/// Longest line accepted from a sensor bridge before the buffer is discarded
const MAX_LINE_LEN: usize = 64;

/// Wait between attempts to (re)open a sensor port
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

/// Source of distance measurements for one sensor
#[async_trait]
pub trait DistanceProbe: Send {
    /// Take one measurement in centimeters, `None` on timeout or read failure
    async fn read_cm(&mut self) -> Option<f64>;
}

/// Parse one line from a sensor bridge
pub fn parse_distance_line(line: &str) -> Option<f64> {
    let value: f64 = line.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Probe backed by a serial sensor bridge
pub struct SerialDistanceProbe {
    device: String,
    baud: u32,
    read_timeout: Duration,
    port: Option<tokio_serial::SerialStream>,
    /// No open attempt before this instant
    retry_at: Option<Instant>,
    /// Failed opens since the port was last usable
    open_failures: u32,
    /// Bytes received after the last complete line
    read_buffer: Vec<u8>,
}

impl SerialDistanceProbe {
    pub fn new(device: &str, baud: u32, read_timeout: Duration) -> Self {
        Self {
            device: device.to_string(),
            baud,
            read_timeout,
            port: None,
            retry_at: None,
            open_failures: 0,
            read_buffer: Vec::with_capacity(MAX_LINE_LEN),
        }
    }

    /// Open the port on first use, and again after it was dropped.
    ///
    /// Failed opens are retried every `REOPEN_BACKOFF`; the probe reports
    /// misses in between. Only the first failure in a row logs an error.
    fn ensure_open(&mut self, now: Instant) -> bool {
        if self.port.is_some() {
            return true;
        }
        if self.retry_at.is_some_and(|at| now < at) {
            return false;
        }

        match tokio_serial::new(&self.device, self.baud)
            .timeout(self.read_timeout)
            .open_native_async()
        {
            Ok(port) => {
                info!(
                    device = %self.device,
                    baud = %self.baud,
                    failed_attempts = %self.open_failures,
                    "probe_port_opened"
                );
                self.port = Some(port);
                self.retry_at = None;
                self.open_failures = 0;
                true
            }
            Err(e) => {
                if self.open_failures == 0 {
                    error!(device = %self.device, error = %e, "probe_port_open_failed");
                } else {
                    debug!(
                        device = %self.device,
                        attempts = %(self.open_failures + 1),
                        "probe_port_still_unavailable"
                    );
                }
                self.open_failures = self.open_failures.saturating_add(1);
                self.retry_at = Some(now + REOPEN_BACKOFF);
                false
            }
        }
    }

    /// Give up on a port that failed mid-read; the next poll reopens it
    fn drop_port(&mut self, error: &std::io::Error) {
        warn!(device = %self.device, error = %error, "probe_port_lost");
        self.port = None;
        self.read_buffer.clear();
        self.retry_at = None;
    }

    /// Pop the newest complete line from the buffer, dropping older ones.
    ///
    /// Only the freshest reading matters; stale lines queued while the loop
    /// was busy are discarded.
    fn take_latest_line(&mut self) -> Option<String> {
        let last_newline = self.read_buffer.iter().rposition(|&b| b == b'\n')?;
        let complete: Vec<u8> = self.read_buffer.drain(..=last_newline).collect();
        let text = String::from_utf8_lossy(&complete);
        text.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string)
    }
}

#[async_trait]
impl DistanceProbe for SerialDistanceProbe {
    async fn read_cm(&mut self) -> Option<f64> {
        if !self.ensure_open(Instant::now()) {
            return None;
        }
        let port = self.port.as_mut()?;

        let mut temp_buf = [0u8; MAX_LINE_LEN];
        match tokio::time::timeout(self.read_timeout, port.read(&mut temp_buf)).await {
            Ok(Ok(n)) if n > 0 => self.read_buffer.extend_from_slice(&temp_buf[..n]),
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {}
            Ok(Err(e)) => {
                self.drop_port(&e);
                return None;
            }
            Err(_) => {}
        }

        let line = self.take_latest_line();

        if self.read_buffer.len() > MAX_LINE_LEN {
            debug!(device = %self.device, discarded = self.read_buffer.len(), "probe_buffer_overflow");
            self.read_buffer.clear();
        }

        line.and_then(|l| parse_distance_line(&l))
    }
}

/// Probe that replays a fixed sequence of readings, then reports misses
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    readings: VecDeque<Option<f64>>,
}

impl ScriptedProbe {
    pub fn new<I>(readings: I) -> Self
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        Self { readings: readings.into_iter().collect() }
    }

    /// A probe with nothing attached
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reading: Option<f64>) {
        self.readings.push_back(reading);
    }

    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

#[async_trait]
impl DistanceProbe for ScriptedProbe {
    async fn read_cm(&mut self) -> Option<f64> {
        self.readings.pop_front().flatten()
    }
}

#[async_trait]
impl<P: DistanceProbe + ?Sized> DistanceProbe for Box<P> {
    async fn read_cm(&mut self) -> Option<f64> {
        (**self).read_cm().await
    }
}

/// Build the probe for one sensor: serial when a device is configured,
/// otherwise an idle probe that only reports misses.
pub fn probe_for(
    role: SensorRole,
    device: Option<&str>,
    baud: u32,
    read_timeout: Duration,
) -> Box<dyn DistanceProbe> {
    match device {
        Some(device) => {
            info!(sensor = %role.as_str(), device = %device, baud = %baud, "probe_configured");
            Box::new(SerialDistanceProbe::new(device, baud, read_timeout))
        }
        None => {
            warn!(sensor = %role.as_str(), "probe_not_configured_idle");
            Box::new(ScriptedProbe::idle())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_distance_line() {
        assert_eq!(parse_distance_line("123.4\r"), Some(123.4));
        assert_eq!(parse_distance_line(" 60 "), Some(60.0));
        assert_eq!(parse_distance_line("timeout"), None);
        assert_eq!(parse_distance_line("-3"), None);
        assert_eq!(parse_distance_line("NaN"), None);
        assert_eq!(parse_distance_line(""), None);
    }

    #[test]
    fn test_take_latest_line_keeps_partial_tail() {
        let mut probe = SerialDistanceProbe::new("/dev/null", 9600, Duration::from_millis(30));
        probe.read_buffer.extend_from_slice(b"80.0\n55.5\n12");

        assert_eq!(probe.take_latest_line().as_deref(), Some("55.5"));
        assert_eq!(probe.read_buffer, b"12");
        assert_eq!(probe.take_latest_line(), None);

        probe.read_buffer.extend_from_slice(b"3.0\n");
        assert_eq!(probe.take_latest_line().as_deref(), Some("123.0"));
        assert!(probe.read_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_probe_replays_then_misses() {
        let mut probe = ScriptedProbe::new([Some(100.0), None, Some(40.0)]);
        assert_eq!(probe.read_cm().await, Some(100.0));
        assert_eq!(probe.read_cm().await, None);
        assert_eq!(probe.read_cm().await, Some(40.0));
        assert_eq!(probe.remaining(), 0);
        assert_eq!(probe.read_cm().await, None);
    }

    #[tokio::test]
    async fn test_unconfigured_probe_is_idle() {
        let mut probe = probe_for(SensorRole::Exit, None, 9600, Duration::from_millis(10));
        assert_eq!(probe.read_cm().await, None);
    }

    #[tokio::test]
    async fn test_serial_probe_missing_device_reports_misses() {
        let mut probe = SerialDistanceProbe::new(
            "/dev/ride-controller-no-such-device",
            9600,
            Duration::from_millis(10),
        );
        assert_eq!(probe.read_cm().await, None);
        assert_eq!(probe.open_failures, 1);
        assert!(probe.retry_at.is_some());
        assert_eq!(probe.read_cm().await, None);
    }

    #[tokio::test]
    async fn test_failed_open_retries_after_backoff() {
        let mut probe = SerialDistanceProbe::new(
            "/dev/ride-controller-no-such-device",
            9600,
            Duration::from_millis(10),
        );
        let t0 = Instant::now();

        assert!(!probe.ensure_open(t0));
        assert_eq!(probe.open_failures, 1);
        assert_eq!(probe.retry_at, Some(t0 + REOPEN_BACKOFF));

        // Inside the backoff nothing is attempted
        assert!(!probe.ensure_open(t0 + Duration::from_millis(500)));
        assert_eq!(probe.open_failures, 1);

        // After it, the port is tried again
        assert!(!probe.ensure_open(t0 + REOPEN_BACKOFF));
        assert_eq!(probe.open_failures, 2);
        assert_eq!(probe.retry_at, Some(t0 + REOPEN_BACKOFF * 2));
    }

    #[tokio::test]
    async fn test_lost_port_is_reopened_on_next_poll() {
        let mut probe = SerialDistanceProbe::new(
            "/dev/ride-controller-no-such-device",
            9600,
            Duration::from_millis(10),
        );
        let t0 = Instant::now();
        assert!(!probe.ensure_open(t0));
        probe.read_buffer.extend_from_slice(b"12");

        probe.drop_port(&std::io::Error::new(ErrorKind::BrokenPipe, "unplugged"));
        assert!(probe.port.is_none());
        assert!(probe.read_buffer.is_empty());

        // No backoff after a lost port: the very next poll tries to open
        assert!(!probe.ensure_open(t0 + Duration::from_millis(50)));
        assert_eq!(probe.open_failures, 2);
    }
}

//! ICMP echo probe with native sockets (high-precision) and command fallback.
//!
//! A batch opens one socket and sends its echo requests back to back from a
//! blocking thread, so timing is not skewed by the async scheduler.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, Prober, Samples};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter shared by all batches in the process.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, or macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// ICMP echo prober for one host.
#[derive(Debug, Clone)]
pub struct IcmpProber {
    host: String,
    timeout: Duration,
}

impl IcmpProber {
    pub fn new(host: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            timeout,
        }
    }
}

impl Prober for IcmpProber {
    async fn run_batch(&self, count: u32) -> Result<Samples, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::Native {
            // Resolve before spawn_blocking (DNS is async)
            let ip = resolve_address(&self.host).await?;
            let timeout = self.timeout;

            let result = tokio::task::spawn_blocking(move || run_blocking_batch(ip, count, timeout))
                .await
                .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

            match result {
                Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                    tracing::warn!(
                        "Native ping not permitted for {}, falling back to command: {}",
                        self.host,
                        msg
                    );
                }
                other => return other,
            }
        }

        run_ping_command(&self.host, count, self.timeout).await
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Address-family specific ICMP parameters.
#[derive(Debug, Clone, Copy)]
struct EchoFamily {
    domain: Domain,
    protocol: Protocol,
    request_type: u8,
    reply_type: u8,
}

impl EchoFamily {
    fn for_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self {
                domain: Domain::IPV4,
                protocol: Protocol::ICMPV4,
                request_type: 8,
                reply_type: 0,
            },
            IpAddr::V6(_) => Self {
                domain: Domain::IPV6,
                protocol: Protocol::ICMPV6,
                request_type: 128,
                reply_type: 129,
            },
        }
    }

    fn is_v4(&self) -> bool {
        self.domain == Domain::IPV4
    }

    /// Open a RAW socket if privileged, otherwise a DGRAM one. Returns whether
    /// the socket is RAW.
    fn open(&self) -> Result<(Socket, bool), ProbeError> {
        if let Ok(s) = Socket::new(self.domain, Type::RAW, Some(self.protocol)) {
            return Ok((s, true));
        }
        Socket::new(self.domain, Type::DGRAM, Some(self.protocol))
            .map(|s| (s, false))
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    ProbeError::Network(format!("Permission denied: {}", e))
                } else {
                    ProbeError::Network(format!("Failed to create ICMP socket: {}", e))
                }
            })
    }
}

/// Send `count` echo requests over one socket. Runs on a blocking thread.
fn run_blocking_batch(ip: IpAddr, count: u32, timeout: Duration) -> Result<Samples, ProbeError> {
    let family = EchoFamily::for_ip(&ip);
    let (socket, raw) = family.open()?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let mut samples = Samples::default();

    for _ in 0..count {
        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        match echo_once(&socket, family, raw, identifier, sequence, timeout) {
            Ok(elapsed) => samples.latencies.push(elapsed.as_secs_f64() * 1000.0),
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                return Err(ProbeError::Network(msg));
            }
            Err(e) => {
                tracing::debug!("ICMP sample to {} failed: {}", ip, e);
                samples.lost += 1;
            }
        }
    }

    Ok(samples)
}

/// One echo round trip. Keeps reading until our reply shows up or the
/// timeout elapses.
fn echo_once(
    socket: &Socket,
    family: EchoFamily,
    raw: bool,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let len = (&*socket).read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => ProbeError::Network(format!("Failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();

        // DGRAM sockets get their identifier rewritten by the kernel, which
        // also filters replies per socket, so only RAW replies are matched on it.
        if is_our_reply(&buf[..len], family, raw.then_some(identifier), sequence) {
            return Ok(elapsed);
        }
    }
}

/// Check whether `data` is the echo reply for `sequence` (and `identifier`
/// when given).
fn is_our_reply(data: &[u8], family: EchoFamily, identifier: Option<u16>, sequence: u16) -> bool {
    // IPv4 RAW sockets deliver the IP header too; ICMPv6 never does.
    let offset = if family.is_v4() && !data.is_empty() && data[0] >> 4 == 4 {
        usize::from(data[0] & 0x0f) * 4
    } else {
        0
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == family.reply_type
        && reply_seq == sequence
        && identifier.map_or(true, |id| id == reply_id)
}

/// Build an echo request: 8 byte header plus 56 byte payload.
fn build_echo_request(family: EchoFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = family.request_type;
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum (it covers a pseudo-header).
    if family.is_v4() {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [odd] = chunks.remainder() {
        sum += u32::from(*odd) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run a batch via the system `ping` command (fallback).
async fn run_ping_command(address: &str, count: u32, timeout: Duration) -> Result<Samples, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-W",
            &timeout_secs.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() && !stdout.contains("packets transmitted") {
        // Nothing was sent (unknown host, bad flags): not a sample failure.
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Command(format!("ping failed: {}", stderr.trim())));
    }

    let latencies = parse_ping_output(&stdout);
    let lost = count.saturating_sub(latencies.len() as u32);
    Ok(Samples { latencies, lost })
}

/// Extract per-reply round trip times (milliseconds) from `ping` output.
fn parse_ping_output(output: &str) -> Vec<f64> {
    // "time=X.XXX ms" (Linux, macOS); "time<1 ms" on some platforms
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    re.captures_iter(output)
        .filter_map(|caps| caps.name("val"))
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

//! Host metrics read from `/proc` and a few coreutils
//!
//! Parsing is kept separate from collection so every parser can be fed
//! captured command output. Collection is best effort: a command that
//! fails leaves the previous value in place.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::client::Client;
use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FsInfo {
    pub mount_point: String,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NetIntfInfo {
    pub ipv4: String,
    pub ipv6: String,
    pub rx: u64,
    pub tx: u64,
}

/// Jiffies from the aggregate `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuRaw {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub soft_irq: u64,
    pub steal: u64,
    pub guest: u64,
    pub total: u64,
}

/// Per-state percentages between two samples; `usage` is a 0..1 fraction
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct CpuInfo {
    pub usage: f32,
    pub user: f32,
    pub nice: f32,
    pub system: f32,
    pub idle: f32,
    pub iowait: f32,
    pub irq: f32,
    pub soft_irq: f32,
    pub steal: f32,
    pub guest: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    #[serde(serialize_with = "serialize_secs")]
    pub uptime: Duration,
    pub hostname: String,
    pub load_1: String,
    pub load_5: String,
    pub load_15: String,
    pub running_procs: String,
    pub total_procs: String,
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_buffers: u64,
    pub mem_cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub fs_infos: Vec<FsInfo>,
    pub net_intf: BTreeMap<String, NetIntfInfo>,
    pub cpu: CpuInfo,
    #[serde(skip)]
    pub prev_cpu: Option<CpuRaw>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_uptime(&mut self, text: &str) {
        if let Some(uptime) = parse_uptime(text) {
            self.uptime = uptime;
        }
    }

    pub fn apply_loadavg(&mut self, text: &str) {
        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() != 5 {
            return;
        }
        self.load_1 = parts[0].to_string();
        self.load_5 = parts[1].to_string();
        self.load_15 = parts[2].to_string();
        if let Some((running, total)) = parts[3].split_once('/') {
            self.running_procs = running.to_string();
            self.total_procs = total.to_string();
        }
    }

    pub fn apply_meminfo(&mut self, text: &str) {
        for line in text.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 3 {
                continue;
            }
            let Ok(kib) = parts[1].parse::<u64>() else {
                continue;
            };
            let bytes = kib * 1024;
            match parts[0] {
                "MemTotal:" => self.mem_total = bytes,
                "MemFree:" => self.mem_free = bytes,
                "Buffers:" => self.mem_buffers = bytes,
                "Cached:" => self.mem_cached = bytes,
                "SwapTotal:" => self.swap_total = bytes,
                "SwapFree:" => self.swap_free = bytes,
                _ => {}
            }
        }
    }

    /// Fold a new `/proc/stat` sample into `cpu`; the first sample only
    /// primes the baseline.
    pub fn apply_cpu(&mut self, text: &str) {
        let Some(now) = parse_cpu(text) else {
            return;
        };
        if let Some(prev) = self.prev_cpu.filter(|p| p.total != 0) {
            self.cpu = cpu_delta(&prev, &now);
        }
        self.prev_cpu = Some(now);
    }

    pub fn apply_ip_addr(&mut self, text: &str) {
        for line in text.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 || (parts[2] != "inet" && parts[2] != "inet6") {
                continue;
            }
            let entry = self.net_intf.entry(parts[1].to_string()).or_default();
            if parts[2] == "inet" {
                entry.ipv4 = parts[3].to_string();
            } else {
                entry.ipv6 = parts[3].to_string();
            }
        }
    }

    /// Byte counters for interfaces already known from `ip -o addr`
    pub fn apply_net_dev(&mut self, text: &str) {
        for line in text.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 17 {
                continue;
            }
            let name = parts[0].trim_end_matches(':');
            let Some(info) = self.net_intf.get_mut(name) else {
                continue;
            };
            if let (Ok(rx), Ok(tx)) = (parts[1].parse(), parts[9].parse()) {
                info.rx = rx;
                info.tx = tx;
            }
        }
    }
}

pub fn parse_uptime(text: &str) -> Option<Duration> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() != 2 {
        return None;
    }
    let secs: f64 = parts[0].parse().ok()?;
    (secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// `df -B1` output; long device names wrap onto a second line
pub fn parse_df(text: &str) -> Vec<FsInfo> {
    let mut infos = Vec::new();
    let mut wrapped = false;

    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let n = parts.len();
        let dev = n > 0 && parts[0].starts_with("/dev/");

        if n == 1 && dev {
            wrapped = true;
            continue;
        }
        if !((n == 5 && wrapped) || (n == 6 && dev)) {
            continue;
        }
        let shift = usize::from(wrapped);
        wrapped = false;

        let (Ok(used), Ok(free)) = (parts[2 - shift].parse(), parts[3 - shift].parse()) else {
            continue;
        };
        infos.push(FsInfo {
            mount_point: parts[5 - shift].to_string(),
            used,
            free,
        });
    }
    infos
}

pub fn parse_cpu(text: &str) -> Option<CpuRaw> {
    let fields: Vec<&str> = text
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .find(|f| f.first() == Some(&"cpu"))?;

    let mut raw = CpuRaw::default();
    for (i, field) in fields.iter().enumerate().skip(1) {
        let Ok(val) = field.parse::<u64>() else {
            continue;
        };
        raw.total += val;
        match i {
            1 => raw.user = val,
            2 => raw.nice = val,
            3 => raw.system = val,
            4 => raw.idle = val,
            5 => raw.iowait = val,
            6 => raw.irq = val,
            7 => raw.soft_irq = val,
            8 => raw.steal = val,
            9 => raw.guest = val,
            _ => {}
        }
    }
    Some(raw)
}

pub fn cpu_delta(prev: &CpuRaw, now: &CpuRaw) -> CpuInfo {
    let total = now.total.saturating_sub(prev.total) as f32;
    if total == 0.0 {
        return CpuInfo::default();
    }
    let pct = |a: u64, b: u64| a.saturating_sub(b) as f32 / total * 100.0;

    let prev_idle = prev.idle + prev.iowait;
    let idle = now.idle + now.iowait;
    let busy = |r: &CpuRaw| r.user + r.nice + r.system + r.irq + r.soft_irq + r.steal;
    let totald = (idle + busy(now)).saturating_sub(prev_idle + busy(prev));
    let idled = idle.saturating_sub(prev_idle);

    CpuInfo {
        usage: if totald == 0 {
            0.0
        } else {
            totald.saturating_sub(idled) as f32 / totald as f32
        },
        user: pct(now.user, prev.user),
        nice: pct(now.nice, prev.nice),
        system: pct(now.system, prev.system),
        idle: pct(now.idle, prev.idle),
        iowait: pct(now.iowait, prev.iowait),
        irq: pct(now.irq, prev.irq),
        soft_irq: pct(now.soft_irq, prev.soft_irq),
        steal: pct(now.steal, prev.steal),
        guest: pct(now.guest, prev.guest),
    }
}

async fn run_command(client: &Arc<Client>, cmd: &str) -> Result<String> {
    let out = client.new_session().await?.output(cmd).await?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Refresh every metric in `stats` from the remote host
pub async fn get_all_stats(client: &Arc<Client>, stats: &mut Stats) {
    let host = client.address();
    macro_rules! collect {
        ($cmd:expr, $apply:expr) => {
            match run_command(client, $cmd).await {
                Ok(text) => $apply(&mut *stats, text.as_str()),
                Err(e) => tracing::debug!(host = %host, cmd = $cmd, "stats command failed: {}", e),
            }
        };
    }

    collect!("/bin/cat /proc/uptime", Stats::apply_uptime);
    collect!("/bin/hostname -f", |s: &mut Stats, t: &str| {
        s.hostname = t.trim().to_string()
    });
    collect!("/bin/cat /proc/loadavg", Stats::apply_loadavg);
    collect!("/bin/cat /proc/meminfo", Stats::apply_meminfo);
    collect!("/bin/df -B1", |s: &mut Stats, t: &str| s.fs_infos = parse_df(t));
    collect!("/bin/cat /proc/stat", Stats::apply_cpu);

    let addrs = match run_command(client, "/bin/ip -o addr").await {
        Ok(text) => Ok(text),
        Err(_) => run_command(client, "/sbin/ip -o addr").await,
    };
    match addrs {
        Ok(text) => {
            stats.apply_ip_addr(&text);
            collect!("/bin/cat /proc/net/dev", Stats::apply_net_dev);
        }
        Err(e) => tracing::debug!(host = %host, "ip addr failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime() {
        assert_eq!(
            parse_uptime("350735.47 234388.90\n"),
            Some(Duration::from_secs_f64(350735.47))
        );
        assert_eq!(parse_uptime("garbage"), None);
    }

    #[test]
    fn test_loadavg() {
        let mut s = Stats::new();
        s.apply_loadavg("0.20 0.18 0.12 1/80 11206\n");
        assert_eq!(s.load_1, "0.20");
        assert_eq!(s.load_15, "0.12");
        assert_eq!(s.running_procs, "1");
        assert_eq!(s.total_procs, "80");
    }

    #[test]
    fn test_meminfo_scaled_to_bytes() {
        let mut s = Stats::new();
        s.apply_meminfo(
            "MemTotal:       16384 kB\nMemFree:         2048 kB\nHugePages_Total:       0\nSwapFree:  1 kB\n",
        );
        assert_eq!(s.mem_total, 16384 * 1024);
        assert_eq!(s.mem_free, 2048 * 1024);
        assert_eq!(s.swap_free, 1024);
    }

    #[test]
    fn test_df_with_wrapped_device() {
        let text = "\
Filesystem     1B-blocks      Used Available Use% Mounted on
/dev/sda1    100000 40000 60000  40% /
/dev/mapper/very-long-volume-name
             200000 50000 150000  25% /data
tmpfs          1000     0   1000   0% /run
";
        let infos = parse_df(text);
        assert_eq!(
            infos,
            vec![
                FsInfo {
                    mount_point: "/".into(),
                    used: 40000,
                    free: 60000
                },
                FsInfo {
                    mount_point: "/data".into(),
                    used: 50000,
                    free: 150000
                },
            ]
        );
    }

    #[test]
    fn test_cpu_needs_two_samples() {
        let mut s = Stats::new();
        s.apply_cpu("cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 1 2 3\n");
        assert_eq!(s.cpu, CpuInfo::default());

        s.apply_cpu("cpu  150 0 150 900 0 0 0 0 0 0\n");
        assert!((s.cpu.usage - 0.5).abs() < 1e-6);
        assert!((s.cpu.user - 25.0).abs() < 1e-4);
        assert!((s.cpu.idle - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_interfaces_and_counters() {
        let mut s = Stats::new();
        s.apply_ip_addr(
            "1: lo    inet 127.0.0.1/8 scope host lo\n2: eth0    inet 10.0.0.5/24 brd 10.0.0.255\n2: eth0    inet6 fe80::1/64 scope link\n",
        );
        s.apply_net_dev(
            "Inter-|   Receive\n face |bytes\n  eth0: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0\n  wlan0: 1 1 0 0 0 0 0 0 1 1 0 0 0 0 0 0\n",
        );
        let eth0 = &s.net_intf["eth0"];
        assert_eq!(eth0.ipv4, "10.0.0.5/24");
        assert_eq!(eth0.ipv6, "fe80::1/64");
        assert_eq!((eth0.rx, eth0.tx), (1000, 2000));
        assert!(!s.net_intf.contains_key("wlan0"));
    }
}

//! Simulated GWAC mount endpoint: one connection carrying every unit of
//! the group.
//!
//! Streams `status` digit frames at the configured cadence, walks each unit
//! through SLEWING → TRACKING after a `slew`, reports `currentpos` while
//! moving or tracking, and acknowledges every command.

use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::interval;
use tracing::{info, warn};

use crate::wire;
use crate::Cli;

const ST_FREEZE: u8 = 1;
const ST_PARKING: u8 = 4;
const ST_PARKED: u8 = 5;
const ST_SLEWING: u8 = 6;
const ST_TRACKING: u8 = 7;

struct Unit {
    state: u8,
    /// Ticks left before a transient state settles.
    settle: u32,
    ra: f64,
    dec: f64,
    target_ra: f64,
    target_dec: f64,
}

impl Unit {
    fn new() -> Self {
        Self {
            state: ST_FREEZE,
            settle: 0,
            ra: 0.0,
            dec: 0.0,
            target_ra: 0.0,
            target_dec: 0.0,
        }
    }

    fn tick(&mut self) {
        if self.settle > 0 {
            self.settle -= 1;
            if self.settle == 0 {
                self.state = match self.state {
                    ST_SLEWING => {
                        self.ra = self.target_ra;
                        self.dec = self.target_dec;
                        ST_TRACKING
                    }
                    ST_PARKING => ST_PARKED,
                    other => other,
                };
            }
        }
    }
}

pub async fn run(cli: Cli) {
    let addr = format!("{}:{}", cli.host, cli.mount_port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("mount: cannot reach broker at {addr}: {e}");
            return;
        }
    };
    info!("mount endpoint connected to {addr}");
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);

    let mut units: Vec<Unit> = (0..cli.units).map(|_| Unit::new()).collect();
    let mut sn: u32 = 0;
    let mut tick = interval(Duration::from_secs_f64(cli.cadence));

    loop {
        let mut line = String::new();
        tokio::select! {
            _ = tick.tick() => {
                for unit in units.iter_mut() {
                    unit.tick();
                }
                // Ten digit slots regardless of populated units.
                let mut digits = String::new();
                for at in 0..10 {
                    let code = units.get(at).map_or(0, |u| u.state);
                    digits.push((b'0' + code) as char);
                }
                sn = sn % 99_999 + 1;
                let frame = format!("g#{}status{digits}{}", cli.gid, wire::tail(sn));
                if wr.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
                // Moving or tracking units also report where they point.
                for (at, unit) in units.iter().enumerate() {
                    if unit.state == ST_SLEWING || unit.state == ST_TRACKING {
                        let jitter = rand::thread_rng().gen_range(-3..=3);
                        sn = sn % 99_999 + 1;
                        let frame = format!(
                            "g#{}{:03}currentpos{:07}%{:+08}{}",
                            cli.gid,
                            at + 1,
                            (unit.ra * 1e4) as i64 + jitter,
                            (unit.dec * 1e4) as i64,
                            wire::tail(sn)
                        );
                        if wr.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
            n = reader.read_line(&mut line) => {
                match n {
                    Ok(0) | Err(_) => {
                        warn!("mount: broker closed the connection");
                        return;
                    }
                    Ok(_) => {}
                }
                let Some(cmd) = wire::split_cmd(&line, &cli.gid) else {
                    continue;
                };
                let ack = wire::ack(&cli.gid, &cmd.uid, &cmd.verb, &cmd.serial);
                if wr.write_all(ack.as_bytes()).await.is_err() {
                    return;
                }
                let Ok(unit_no) = cmd.uid.parse::<usize>() else {
                    continue;
                };
                let Some(unit) = unit_no.checked_sub(1).and_then(|at| units.get_mut(at)) else {
                    continue;
                };
                match cmd.verb.as_str() {
                    "slew" | "HA" => {
                        let mut parts = cmd.payload.split('%');
                        let ra = parts.next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
                        let dec = parts.next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
                        unit.target_ra = ra as f64 * 1e-4;
                        unit.target_dec = dec as f64 * 1e-4;
                        unit.state = ST_SLEWING;
                        unit.settle = 2;
                        info!(
                            "mount unit {unit_no}: slewing to <{:.4} {:.4}>",
                            unit.target_ra, unit.target_dec
                        );
                    }
                    "abortslew" => {
                        unit.state = ST_FREEZE;
                        unit.settle = 0;
                    }
                    "park" => {
                        unit.state = ST_PARKING;
                        unit.settle = 2;
                    }
                    "track" => {
                        unit.state = ST_TRACKING;
                        unit.settle = 0;
                    }
                    "homera" | "sync" | "guide" | "trackvel" => {
                        // Acknowledged above; no state change worth modelling.
                    }
                    other => {
                        info!("mount unit {unit_no}: ignoring verb {other}");
                    }
                }
            }
        }
    }
}

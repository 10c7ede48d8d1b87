//! Simulated GWAC focuser endpoint: five channels per unit of the group.
//!
//! Streams one `focus` frame per unit per cadence and applies relative
//! moves from the broker a few steps at a time, so position-stable
//! detection on the other side has something to chew on.

use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::interval;
use tracing::{info, warn};

use obs_proto::gwac::FOCUS_TAGS;

use crate::wire;
use crate::Cli;

/// Steps a channel moves per tick while approaching its target.
const STEP_RATE: i32 = 20;

pub async fn run(cli: Cli) {
    let addr = format!("{}:{}", cli.host, cli.focus_port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("focuser: cannot reach broker at {addr}: {e}");
            return;
        }
    };
    info!("focuser endpoint connected to {addr}");
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);

    // positions[unit][channel] with matching move targets.
    let mut positions = vec![[0i32; 5]; cli.units];
    let mut targets = vec![[0i32; 5]; cli.units];
    for unit in positions.iter_mut() {
        for channel in unit.iter_mut() {
            *channel = rand::thread_rng().gen_range(-50..=50);
        }
    }
    for (unit, pos) in targets.iter_mut().zip(positions.iter()) {
        unit.copy_from_slice(pos);
    }

    let mut sn: u32 = 0;
    let mut tick = interval(Duration::from_secs_f64(cli.cadence));

    loop {
        let mut line = String::new();
        tokio::select! {
            _ = tick.tick() => {
                for unit_at in 0..cli.units {
                    for channel in 0..5 {
                        let pos = positions[unit_at][channel];
                        let tar = targets[unit_at][channel];
                        let delta = (tar - pos).clamp(-STEP_RATE, STEP_RATE);
                        positions[unit_at][channel] = pos + delta;
                    }
                    let mut payload = String::new();
                    for (channel, tag) in FOCUS_TAGS.iter().enumerate() {
                        payload.push_str(tag);
                        payload.push_str(&format!("{:+05}", positions[unit_at][channel]));
                    }
                    sn = sn % 99_999 + 1;
                    let frame = format!(
                        "g#{}{:03}focus{payload}{}",
                        cli.gid,
                        unit_at + 1,
                        wire::tail(sn)
                    );
                    if wr.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            n = reader.read_line(&mut line) => {
                match n {
                    Ok(0) | Err(_) => {
                        warn!("focuser: broker closed the connection");
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
                if cmd.verb != "focus" {
                    continue;
                }
                // Payload: three-digit camera id then a signed step count.
                if cmd.payload.len() < 4 {
                    continue;
                }
                let (cid, rel) = cmd.payload.split_at(3);
                let (Ok(cid), Ok(rel)) = (cid.parse::<usize>(), rel.parse::<i32>()) else {
                    continue;
                };
                if cid == 0 {
                    continue;
                }
                let unit_at = (cid - 1) / 5;
                let channel = (cid - 1) % 5;
                if unit_at >= cli.units {
                    continue;
                }
                targets[unit_at][channel] += rel;
                info!(
                    "focuser: channel {cid:03} moving by {rel} to {}",
                    targets[unit_at][channel]
                );
            }
        }
    }
}

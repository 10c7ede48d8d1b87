//! Simulated camera process for one unit: reports `camera` KV status and
//! runs an EXPOSING → IMGRDY → IDLE sequence per received plan.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{interval, Instant};
use tracing::{info, warn};

use obs_proto::kv::{CameraReport, Envelope, KvBody, KvFrame, ObsPlan};
use obs_proto::types::{CameraState, EXP_START, EXP_STOP};

use crate::Cli;

struct Sequence {
    plan: ObsPlan,
    frmno: i32,
    exposure_started: Instant,
}

pub async fn run(cli: Cli, unit: usize) {
    let addr = format!("{}:{}", cli.host, cli.camera_port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("camera {unit}: cannot reach broker at {addr}: {e}");
            return;
        }
    };
    let uid = format!("{unit:03}");
    let cid = "001".to_string();
    info!("camera <{}:{uid}:{cid}> connected to {addr}", cli.gid);
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);

    let mut state = CameraState::Idle;
    let mut seq: Option<Sequence> = None;
    let mut tick = interval(Duration::from_secs_f64(cli.cadence));

    loop {
        let mut line = String::new();
        tokio::select! {
            _ = tick.tick() => {
                // Advance the exposure sequence.
                if let Some(active) = seq.as_mut() {
                    if state == CameraState::Exposing
                        && active.exposure_started.elapsed().as_secs_f64() >= active.plan.exptime
                    {
                        active.frmno += 1;
                        if active.frmno >= active.plan.frmcnt.max(1) {
                            info!(
                                "camera <{}:{uid}:{cid}>: sequence <{}> complete",
                                cli.gid, active.plan.plan_sn
                            );
                            state = CameraState::Idle;
                            seq = None;
                        } else {
                            state = CameraState::ImageReady;
                        }
                    } else if state == CameraState::ImageReady {
                        active.exposure_started = Instant::now();
                        state = CameraState::Exposing;
                    }
                }

                let report = CameraReport {
                    state: state as i32,
                    errcode: 0,
                    left: 0.0,
                    percent: 0.0,
                    coolget: -40,
                    imgtype: seq.as_ref().map_or_else(String::new, |s| s.plan.imgtype.clone()),
                    filter: String::new(),
                    freedisk: 512,
                    plan_sn: seq.as_ref().map_or_else(String::new, |s| s.plan.plan_sn.clone()),
                    loopno: 0,
                    frmno: seq.as_ref().map_or(0, |s| s.frmno),
                    filename: String::new(),
                };
                let frame = KvFrame::new(
                    Envelope::with_cid(&cli.gid, &uid, &cid),
                    KvBody::Camera(report),
                );
                if wr.write_all(frame.encode().as_bytes()).await.is_err() {
                    return;
                }
            }
            n = reader.read_line(&mut line) => {
                match n {
                    Ok(0) | Err(_) => {
                        warn!("camera <{}:{uid}:{cid}>: broker closed the connection", cli.gid);
                        return;
                    }
                    Ok(_) => {}
                }
                let Ok(frame) = KvFrame::parse(&line) else {
                    continue;
                };
                match frame.body {
                    KvBody::AppendGwac(plan) | KvBody::AppendPlan(plan) => {
                        info!(
                            "camera <{}:{uid}:{cid}>: plan <{}> described",
                            cli.gid, plan.plan_sn
                        );
                        seq = Some(Sequence {
                            plan,
                            frmno: 0,
                            exposure_started: Instant::now(),
                        });
                    }
                    KvBody::Expose(cmd) if cmd.command == EXP_START => {
                        if let Some(active) = seq.as_mut() {
                            active.frmno = cmd.frmno;
                            active.exposure_started = Instant::now();
                            state = CameraState::Exposing;
                        }
                    }
                    KvBody::Expose(cmd) if cmd.command == EXP_STOP => {
                        state = CameraState::Idle;
                        seq = None;
                    }
                    _ => {}
                }
            }
        }
    }
}

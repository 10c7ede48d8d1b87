//! End-to-end scenarios over real sockets: a dispatcher with ephemeral
//! ports, fake devices on the GWAC endpoints and a KV client driving plans.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use gtoaes::config::Config;
use gtoaes::hub::Hub;

struct Wire {
    reader: BufReader<OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Wire {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (rd, writer) = stream.into_split();
        Self {
            reader: BufReader::new(rd),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Read until a line satisfies `pred`; panic after `secs`.
    async fn expect<F: Fn(&str) -> bool>(&mut self, secs: u64, what: &str, pred: F) -> String {
        let deadline = Duration::from_secs(secs);
        let fut = async {
            loop {
                let mut line = String::new();
                let n = self.reader.read_line(&mut line).await.unwrap();
                assert!(n > 0, "connection closed while waiting for {what}");
                if pred(line.trim_end()) {
                    return line.trim_end().to_string();
                }
            }
        };
        timeout(deadline, fut)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    /// Expect silence: no line satisfying `pred` within `secs`.
    async fn expect_none<F: Fn(&str) -> bool>(&mut self, secs: u64, what: &str, pred: F) {
        let fut = async {
            loop {
                let mut line = String::new();
                let n = self.reader.read_line(&mut line).await.unwrap_or(0);
                if n == 0 {
                    // Peer closed; silence achieved.
                    std::future::pending::<()>().await;
                }
                if pred(line.trim_end()) {
                    return line.trim_end().to_string();
                }
            }
        };
        if let Ok(line) = timeout(Duration::from_secs(secs), fut).await {
            panic!("unexpected {what}: {line}");
        }
    }

    /// Discard whatever is already buffered or in flight.
    async fn drain(&mut self) {
        loop {
            let mut line = String::new();
            match timeout(Duration::from_millis(100), self.reader.read_line(&mut line)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => break,
            }
        }
    }

    /// Read until the peer closes the connection; panic after `secs`.
    async fn expect_closed(&mut self, secs: u64) {
        let fut = async {
            loop {
                let mut line = String::new();
                if self.reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
            }
        };
        timeout(Duration::from_secs(secs), fut)
            .await
            .expect("timed out waiting for close");
    }
}

async fn start_hub() -> Hub {
    let mut cfg = Config::default();
    cfg.network.client.port = 0;
    cfg.network.mount_gwac.port = 0;
    cfg.network.camera_gwac.port = 0;
    cfg.network.focus_gwac.port = 0;
    cfg.network.mount_gft.port = 0;
    cfg.network.camera_gft.port = 0;
    Hub::start(cfg).await.unwrap()
}

const STATUS_FREEZE: &str = "g#001status1111100000%2024-03-29%13:07:26%32846%\n";
const STATUS_TRACKING: &str = "g#001status7111100000%2024-03-29%13:07:36%32847%\n";

#[tokio::test]
async fn gwac_plan_runs_to_completion() {
    let hub = start_hub().await;
    let ports = hub.ports();

    // A group status frame brings the whole group's units into being.
    let mut mount = Wire::connect(ports.mount_gwac).await;
    mount.send(STATUS_FREEZE).await;

    let mut camera = Wire::connect(ports.camera_gwac).await;
    camera
        .send("camera gid=001,uid=001,cid=001,state=1,\n")
        .await;
    sleep(Duration::from_millis(300)).await;

    let mut client = Wire::connect(ports.client).await;
    sleep(Duration::from_millis(100)).await;
    client
        .send(
            "append_gwac gid=001,uid=001,plan_sn=P1,ra=10.0,dec=20.0,imgtype=OBJECT,\
             exptime=5,frmcnt=3,plan_end=2099-01-01T00:00:00\n",
        )
        .await;

    // The plan slews the mount with the unit's first serial.
    mount
        .expect(15, "slew command", |l| {
            l.starts_with("g#001001slew0100000%+0200000%")
        })
        .await;
    client
        .expect(10, "cataloged plan state", |l| {
            l.starts_with("plan ") && l.contains("plan_sn=P1") && l.contains("state=1,")
        })
        .await;
    client
        .expect(10, "running plan state", |l| {
            l.starts_with("plan ") && l.contains("plan_sn=P1") && l.contains("state=4,")
        })
        .await;

    // The camera got the plan description while the mount was moving.
    camera
        .expect(10, "plan description", |l| {
            l.starts_with("append_gwac ") && l.contains("plan_sn=P1")
        })
        .await;

    // Arrival at the target starts the exposure.
    mount.send(STATUS_TRACKING).await;
    camera
        .expect(10, "exposure start", |l| {
            l.starts_with("expose ") && l.contains("command=0,") && l.contains("frmno=0,")
        })
        .await;

    // Three frames later the camera drops back to idle: plan over.
    camera
        .send("camera gid=001,uid=001,cid=001,state=2,frmno=0,plan_sn=P1,\n")
        .await;
    camera
        .send("camera gid=001,uid=001,cid=001,state=1,frmno=2,plan_sn=P1,\n")
        .await;
    client
        .expect(10, "plan over", |l| {
            l.starts_with("plan ") && l.contains("plan_sn=P1") && l.contains("state=5,")
        })
        .await;

    hub.stop().await;
}

#[tokio::test]
async fn abort_preempts_running_plan() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut mount = Wire::connect(ports.mount_gwac).await;
    mount.send(STATUS_FREEZE).await;
    let mut camera = Wire::connect(ports.camera_gwac).await;
    camera
        .send("camera gid=001,uid=001,cid=001,state=1,\n")
        .await;
    sleep(Duration::from_millis(300)).await;

    let mut client = Wire::connect(ports.client).await;
    sleep(Duration::from_millis(100)).await;
    client
        .send("append_gwac gid=001,uid=001,plan_sn=P2,ra=10,dec=20,exptime=5,frmcnt=3\n")
        .await;
    mount
        .expect(15, "slew command", |l| l.contains("slew0100000%"))
        .await;
    mount.send(STATUS_TRACKING).await;
    camera
        .expect(10, "exposure start", |l| {
            l.starts_with("expose ") && l.contains("command=0,")
        })
        .await;
    camera
        .send("camera gid=001,uid=001,cid=001,state=2,plan_sn=P2,\n")
        .await;
    sleep(Duration::from_millis(200)).await;

    client.send("abort gid=001,uid=001,\n").await;
    mount
        .expect(10, "abort slew", |l| l.contains("abortslew"))
        .await;
    camera
        .expect(10, "exposure stop", |l| {
            l.starts_with("expose ") && l.contains("command=1,")
        })
        .await;
    client
        .expect(10, "interrupted plan state", |l| {
            l.starts_with("plan ") && l.contains("plan_sn=P2") && l.contains("state=6,")
        })
        .await;

    hub.stop().await;
}

#[tokio::test]
async fn unacknowledged_command_is_retransmitted_three_times() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut mount = Wire::connect(ports.mount_gwac).await;
    mount.send(STATUS_FREEZE).await;
    sleep(Duration::from_millis(300)).await;

    let mut client = Wire::connect(ports.client).await;
    client.send("slew gid=001,uid=001,ra=10,dec=20\n").await;

    let first = mount
        .expect(10, "slew command", |l| l.contains("slew0100000%"))
        .await;
    // No response: the identical bytes reappear once per second, three
    // times, then the entry is dropped.
    for round in 1..=3 {
        let again = mount
            .expect(5, "retransmission", |l| l.contains("slew0100000%"))
            .await;
        assert_eq!(again, first, "retransmission {round} altered the bytes");
    }
    mount
        .expect_none(3, "fourth retransmission", |l| l.contains("slew0100000%"))
        .await;

    hub.stop().await;
}

#[tokio::test]
async fn response_stops_retransmission() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut mount = Wire::connect(ports.mount_gwac).await;
    mount.send(STATUS_FREEZE).await;
    sleep(Duration::from_millis(300)).await;

    let mut client = Wire::connect(ports.client).await;
    client.send("slew gid=001,uid=001,ra=10,dec=20\n").await;

    let cmd = mount
        .expect(10, "slew command", |l| l.contains("slew0100000%"))
        .await;
    let serial = cmd.trim_end_matches('%').rsplit('%').next().unwrap();
    mount
        .send(&format!(
            "g#001001slewRec%2024-03-29%13:07:27%{serial}%\n"
        ))
        .await;
    // A retransmission may already have been in flight; let it land, then
    // require silence.
    sleep(Duration::from_millis(1500)).await;
    mount.drain().await;
    mount
        .expect_none(3, "retransmission after response", |l| {
            l.contains("slew0100000%")
        })
        .await;

    hub.stop().await;
}

#[tokio::test]
async fn focus_loop_closes_through_fwhm() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut mount = Wire::connect(ports.mount_gwac).await;
    mount.send(STATUS_FREEZE).await;
    let mut camera = Wire::connect(ports.camera_gwac).await;
    camera
        .send("camera gid=001,uid=001,cid=001,state=1,\n")
        .await;
    sleep(Duration::from_millis(300)).await;

    // Channel `es` of unit 001 belongs to camera 001.
    let mut focus = Wire::connect(ports.focus_gwac).await;
    focus
        .send("g#001001focuses+0010ws+0011wn+0012en+0013mid+0015%2024-03-29%13:07:26%00009%\n")
        .await;
    sleep(Duration::from_millis(200)).await;

    let mut client = Wire::connect(ports.client).await;
    client
        .send("fwhm gid=001,uid=001,cid=001,fwhm=2.345,tmimg=2024-03-29T13:07:26\n")
        .await;
    focus
        .expect(10, "closed-loop focus command", |l| {
            l.starts_with("g#001001fwhm001002345T130726000%")
        })
        .await;

    // The focuser settles at 15: one change plus three identical readings
    // close out the move and the camera gets the final position echoed.
    for sn in 10..14 {
        focus
            .send(&format!(
                "g#001001focuses+0015ws+0011wn+0012en+0013mid+0015%2024-03-29%13:07:30%{sn:05}%\n"
            ))
            .await;
        sleep(Duration::from_millis(100)).await;
    }
    camera
        .expect(10, "echoed focus position", |l| {
            l.starts_with("focus ")
                && l.contains("cid=001")
                && l.contains("pos=15,")
                && l.contains("posTar=15,")
        })
        .await;

    hub.stop().await;
}

#[tokio::test]
async fn undecodable_client_frame_closes_connection() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut client = Wire::connect(ports.client).await;
    client.send("append_gwac ra=NaN,dec=20.0\n").await;
    client.expect_closed(5).await;

    hub.stop().await;
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut client = Wire::connect(ports.client).await;
    let huge = "a".repeat(5000);
    client.send(&huge).await;
    client.expect_closed(5).await;

    hub.stop().await;
}

#[tokio::test]
async fn gwac_device_noise_is_tolerated() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut mount = Wire::connect(ports.mount_gwac).await;
    mount.send("!handshake noise\n").await;
    mount.send(STATUS_FREEZE).await;
    sleep(Duration::from_millis(300)).await;

    // The link survived the noise: a client slew still reaches it.
    let mut client = Wire::connect(ports.client).await;
    client.send("slew gid=001,uid=001,ra=1,dec=2\n").await;
    mount
        .expect(10, "slew command", |l| l.contains("slew0010000%"))
        .await;

    hub.stop().await;
}

#[tokio::test]
async fn status_broadcast_reaches_clients() {
    let hub = start_hub().await;
    let ports = hub.ports();

    let mut mount = Wire::connect(ports.mount_gwac).await;
    mount.send(STATUS_FREEZE).await;
    let mut camera = Wire::connect(ports.camera_gwac).await;
    camera
        .send("camera gid=001,uid=001,cid=001,state=1,\n")
        .await;

    let mut client = Wire::connect(ports.client).await;
    client
        .expect(10, "mount broadcast", |l| {
            l.starts_with("mount ") && l.contains("gid=001,") && l.contains("state=1,")
        })
        .await;
    client
        .expect(10, "camera broadcast", |l| {
            l.starts_with("camera ") && l.contains("cid=001,")
        })
        .await;

    hub.stop().await;
}

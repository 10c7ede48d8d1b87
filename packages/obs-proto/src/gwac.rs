//! Positional GWAC dialect: `g#GGG[UUU]<verb><payload>%date%time%serial%`.
//!
//! The `%` character is both the field separator and the terminator. Status
//! frames address a whole group; position, focus and response frames name a
//! single unit. Outbound commands carry a five-digit serial drawn from one
//! per-unit counter that wraps 99 999 → 1; the dialect has no in-band ACK,
//! so the caller queues every command for retransmission until a `...Rec...`
//! response quotes the serial back.
//!
//! All encodings are integer fixed-point: ra/dec ×10 000, track rates and
//! FWHM ×1 000. A negative hour angle is normalised by +360°.

use chrono::{NaiveDateTime, Timelike, Utc};

use crate::types::GwacDevice;
use crate::ProtoError;

/// Serials run `[1, 99_999]`; the value after 99 999 is 1, never 0.
pub const SERIAL_MAX: u32 = 99_999;

/// Focus-channel tags in payload order `es ws wn en mid`, mapped to
/// positions 0..4 of a unit's focus block.
pub const FOCUS_TAGS: [&str; 5] = ["es", "ws", "wn", "en", "mid"];

// ── Inbound frames ────────────────────────────────────────────────────────────

/// Payload of one inbound positional frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GwacBody {
    /// `status`: one digit of mount state per unit, indexed from unit 1.
    Status { states: Vec<u8> },
    /// `currentpos`: pointing position of a single unit, degrees.
    Position { ra: f64, dec: f64 },
    /// `focus`: the five focus positions of one unit, steps.
    Focus { pos: [Option<i32>; 5] },
    /// Any verb with `Rec` in it: acknowledgement of a prior command.
    Response,
}

/// One decoded positional frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GwacFrame {
    pub gid: String,
    /// Empty for group-addressed frames (`status`).
    pub uid: String,
    /// `CCYY-MM-DDThh:mm:ss`, rebuilt from the date and time fields.
    pub utc: String,
    pub serial: u32,
    pub body: GwacBody,
}

impl GwacFrame {
    /// Decode one wire line. The trailing newline is optional.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let s = line.trim_end_matches(['\n', '\r']);
        if !s.starts_with("g#") || !s.ends_with('%') {
            return Err(ProtoError::Malformed(format!("missing frame marks: {s}")));
        }

        // Split off the three trailing fields: date, time, serial.
        let fields: Vec<&str> = s[..s.len() - 1].split('%').collect();
        if fields.len() < 4 {
            return Err(ProtoError::Malformed(format!("too few fields: {s}")));
        }
        let serial_str = fields[fields.len() - 1];
        let serial: u32 = serial_str
            .parse()
            .map_err(|_| ProtoError::BadNumber {
                key: "serial".into(),
                value: serial_str.to_string(),
            })?;
        let utc = format!("{}T{}", fields[fields.len() - 3], fields[fields.len() - 2]);
        let head = &fields[0][2..];

        // A response echoes the verb with `Rec` appended; it outranks every
        // other verb match.
        if head.contains("Rec") {
            let gid = head.get(..3).unwrap_or_default().to_string();
            let uid_run = head.get(3..6).unwrap_or_default();
            let uid = if uid_run.len() == 3 && uid_run.bytes().all(|b| b.is_ascii_digit()) {
                uid_run.to_string()
            } else {
                String::new()
            };
            return Ok(Self {
                gid,
                uid,
                utc,
                serial,
                body: GwacBody::Response,
            });
        }

        if let Some(pos) = head.find("status") {
            let gid = head[..pos].to_string();
            let digits = &head[pos + "status".len()..];
            let mut states = Vec::with_capacity(digits.len());
            for ch in digits.chars() {
                if !ch.is_ascii_digit() {
                    return Err(ProtoError::Malformed(format!("bad status digit: {s}")));
                }
                states.push(ch as u8 - b'0');
            }
            return Ok(Self {
                gid,
                uid: String::new(),
                utc,
                serial,
                body: GwacBody::Status { states },
            });
        }

        if let Some(pos) = head.find("currentpos") {
            let (gid, uid) = split_addr(head, pos);
            let ra_str = &head[pos + "currentpos".len()..];
            if fields.len() < 5 {
                return Err(ProtoError::Malformed(format!("truncated position: {s}")));
            }
            let dec_str = fields[1];
            let ra = fixed4(ra_str)?;
            let dec = fixed4(dec_str)?;
            return Ok(Self {
                gid,
                uid,
                utc,
                serial,
                body: GwacBody::Position { ra, dec },
            });
        }

        if let Some(pos) = head.find("focus") {
            let (gid, uid) = split_addr(head, pos);
            let payload = &head[pos + "focus".len()..];
            let body = parse_focus_groups(payload)
                .ok_or_else(|| ProtoError::Malformed(format!("bad focus payload: {s}")))?;
            return Ok(Self {
                gid,
                uid,
                utc,
                serial,
                body,
            });
        }

        Err(ProtoError::UnknownType(s.to_string()))
    }
}

/// `gid` is everything before the unit tag; the unit tag is the three
/// characters just ahead of the verb when present.
fn split_addr(head: &str, verb_at: usize) -> (String, String) {
    if verb_at >= 6 && head[verb_at - 3..verb_at].bytes().all(|b| b.is_ascii_digit()) {
        (
            head[..verb_at - 3].to_string(),
            head[verb_at - 3..verb_at].to_string(),
        )
    } else {
        (head[..verb_at].to_string(), String::new())
    }
}

fn fixed4(s: &str) -> Result<f64, ProtoError> {
    if s.is_empty() {
        return Err(ProtoError::BadNumber {
            key: "position".into(),
            value: String::new(),
        });
    }
    let v: i64 = s.parse().map_err(|_| ProtoError::BadNumber {
        key: "position".into(),
        value: s.to_string(),
    })?;
    Ok(v as f64 * 1e-4)
}

/// Payload is a run of `<tag><signed int>` groups, e.g.
/// `es+0010en-0030ws+0020wn-0025mid+0015`.
fn parse_focus_groups(payload: &str) -> Option<GwacBody> {
    let mut pos: [Option<i32>; 5] = [None; 5];
    let mut tag = String::new();
    let mut num = String::new();
    let mut seen = false;

    let commit = |tag: &str, num: &str, pos: &mut [Option<i32>; 5]| -> bool {
        let Some(idx) = FOCUS_TAGS.iter().position(|t| tag.eq_ignore_ascii_case(t)) else {
            return false;
        };
        let Ok(v) = num.parse::<i32>() else {
            return false;
        };
        pos[idx] = Some(v);
        true
    };

    for ch in payload.chars() {
        if ch.is_ascii_alphabetic() {
            if !tag.is_empty() && !num.is_empty() {
                if !commit(&tag, &num, &mut pos) {
                    return None;
                }
                seen = true;
                tag.clear();
                num.clear();
            }
            tag.push(ch);
        } else {
            num.push(ch);
        }
    }
    if !tag.is_empty() && !num.is_empty() {
        if !commit(&tag, &num, &mut pos) {
            return None;
        }
        seen = true;
    }

    seen.then_some(GwacBody::Focus { pos })
}

// ── Outbound commands ─────────────────────────────────────────────────────────

/// One assembled command: the wire line plus the bookkeeping the caller
/// needs to queue it for retransmission.
#[derive(Debug, Clone, PartialEq)]
pub struct GwacCommand {
    pub serial: u32,
    pub device: GwacDevice,
    pub line: String,
}

/// Command assembler for one observation unit. Owns the unit's serial
/// counter and stamps every command with the current UTC date and time.
#[derive(Debug, Clone)]
pub struct GwacEncoder {
    gid: String,
    uid: String,
    sn: u32,
}

impl GwacEncoder {
    pub fn new(gid: &str, uid: &str) -> Self {
        Self {
            gid: gid.to_string(),
            uid: uid.to_string(),
            sn: 0,
        }
    }

    fn next_sn(&mut self) -> u32 {
        self.sn = if self.sn >= SERIAL_MAX { 1 } else { self.sn + 1 };
        self.sn
    }

    fn stamp() -> (String, String) {
        let now = Utc::now();
        (
            now.format("%Y-%m-%d").to_string(),
            now.format("%H:%M:%S").to_string(),
        )
    }

    fn assemble(&mut self, device: GwacDevice, verb_payload: &str) -> GwacCommand {
        let serial = self.next_sn();
        let (date, time) = Self::stamp();
        let line = format!(
            "g#{}{}{}%{}%{}%{:05}%\n",
            self.gid, self.uid, verb_payload, date, time, serial
        );
        GwacCommand {
            serial,
            device,
            line,
        }
    }

    /// Point to `(ra, dec)` in degrees and start tracking.
    pub fn slew(&mut self, ra: f64, dec: f64) -> GwacCommand {
        let payload = format!("slew{:07}%{:+08}", fixed4_int(ra), fixed4_int(dec));
        self.assemble(GwacDevice::Mount, &payload)
    }

    /// Point by hour angle; a negative hour angle is normalised by +360°.
    pub fn slew_ha(&mut self, ha: f64, dec: f64) -> GwacCommand {
        let ha = if ha < 0.0 { ha + 360.0 } else { ha };
        let payload = format!("HA{:07}%{:+08}", fixed4_int(ha), fixed4_int(dec));
        self.assemble(GwacDevice::Mount, &payload)
    }

    /// Apply a guiding correction, arcseconds per axis.
    pub fn guide(&mut self, ra: i32, dec: i32) -> GwacCommand {
        let payload = format!("guide{ra:+06}%{dec:+06}");
        self.assemble(GwacDevice::Mount, &payload)
    }

    pub fn park(&mut self) -> GwacCommand {
        self.assemble(GwacDevice::Mount, "park")
    }

    pub fn abort_slew(&mut self) -> GwacCommand {
        self.assemble(GwacDevice::Mount, "abortslew")
    }

    /// Search the axis zero points.
    pub fn find_home(&mut self, ra: bool, dec: bool) -> GwacCommand {
        let payload = format!("homera{}dec{}", ra as u8, dec as u8);
        self.assemble(GwacDevice::Mount, &payload)
    }

    /// Declare the current pointing to be `(ra, dec)`, degrees.
    pub fn home_sync(&mut self, ra: f64, dec: f64) -> GwacCommand {
        let payload = format!("sync{:07}%{:+08}", fixed4_int(ra), fixed4_int(dec));
        self.assemble(GwacDevice::Mount, &payload)
    }

    /// Switch a stationary mount into sidereal tracking.
    pub fn track(&mut self) -> GwacCommand {
        self.assemble(GwacDevice::Mount, "track")
    }

    /// Set a non-sidereal tracking rate, degrees per second ×1 000.
    pub fn track_vel(&mut self, ra: f64, dec: f64) -> GwacCommand {
        let payload = format!("trackvel{:+06}%{:+06}", fixed3_int(ra), fixed3_int(dec));
        self.assemble(GwacDevice::Mount, &payload)
    }

    /// Move one focus channel by `rel_pos` steps.
    pub fn focus(&mut self, cid: &str, rel_pos: i32) -> GwacCommand {
        let payload = format!("focus{cid}{rel_pos:+05}");
        self.assemble(GwacDevice::Focus, &payload)
    }

    /// Re-declare the current position of one focus channel as zero.
    pub fn focus_sync(&mut self, cid: &str) -> GwacCommand {
        let payload = format!("focussync{cid}");
        self.assemble(GwacDevice::Focus, &payload)
    }

    /// Feed a FWHM measurement to the focuser's closed loop. The image time
    /// rides along as `Thhmmsssss` so the focuser can reject stale samples.
    pub fn fwhm(&mut self, cid: &str, fwhm: f64, tmimg: NaiveDateTime) -> GwacCommand {
        let t = tmimg.time();
        let millis = t.nanosecond() / 1_000_000;
        let payload = format!(
            "fwhm{}{:06}T{:02}{:02}{:02}{:03}",
            cid,
            fixed3_int(fwhm),
            t.hour(),
            t.minute(),
            t.second(),
            millis
        );
        self.assemble(GwacDevice::Focus, &payload)
    }
}

fn fixed4_int(v: f64) -> i64 {
    (v * 1e4).round() as i64
}

fn fixed3_int(v: f64) -> i64 {
    (v * 1e3).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_status() {
        let frame = GwacFrame::parse("g#001status1111100000%2024-03-29%13:07:26%32846%\n").unwrap();
        assert_eq!(frame.gid, "001");
        assert_eq!(frame.uid, "");
        assert_eq!(frame.serial, 32846);
        assert_eq!(frame.utc, "2024-03-29T13:07:26");
        let GwacBody::Status { states } = frame.body else {
            panic!();
        };
        assert_eq!(states, vec![1, 1, 1, 1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn parses_current_position() {
        let frame =
            GwacFrame::parse("g#001003currentpos0123456%-0200000%2024-03-29%13:07:26%00005%")
                .unwrap();
        assert_eq!(frame.gid, "001");
        assert_eq!(frame.uid, "003");
        let GwacBody::Position { ra, dec } = frame.body else {
            panic!();
        };
        assert!((ra - 12.3456).abs() < 1e-9);
        assert!((dec + 20.0).abs() < 1e-9);
    }

    #[test]
    fn parses_focus_block() {
        let frame = GwacFrame::parse(
            "g#002006focuses+0010en-0030ws+0020wn-0025mid+0015%2024-03-29%13:07:26%00007%",
        )
        .unwrap();
        assert_eq!(frame.gid, "002");
        assert_eq!(frame.uid, "006");
        let GwacBody::Focus { pos } = frame.body else {
            panic!();
        };
        // Payload order es/en/ws/wn/mid lands in tag positions 0/3/1/2/4.
        assert_eq!(pos[0], Some(10));
        assert_eq!(pos[1], Some(20));
        assert_eq!(pos[2], Some(-25));
        assert_eq!(pos[3], Some(-30));
        assert_eq!(pos[4], Some(15));
    }

    #[test]
    fn response_outranks_verbs() {
        let frame = GwacFrame::parse("g#001001slewRec%2024-03-29%13:07:27%00001%").unwrap();
        assert_eq!(frame.gid, "001");
        assert_eq!(frame.uid, "001");
        assert_eq!(frame.serial, 1);
        assert_eq!(frame.body, GwacBody::Response);
    }

    #[test]
    fn rejects_unframed_noise() {
        assert!(GwacFrame::parse("hello world").is_err());
        assert!(GwacFrame::parse("g#001status11%").is_err());
        assert!(GwacFrame::parse("g#001gibberish%2024-03-29%13:07:26%00001%").is_err());
    }

    #[test]
    fn slew_encoding_matches_dialect() {
        let mut enc = GwacEncoder::new("001", "001");
        let cmd = enc.slew(10.0, 20.0);
        assert_eq!(cmd.serial, 1);
        assert_eq!(cmd.device, GwacDevice::Mount);
        assert!(cmd.line.starts_with("g#001001slew0100000%+0200000%"));
        assert!(cmd.line.ends_with("%00001%\n"));
    }

    #[test]
    fn negative_dec_keeps_sign_and_width() {
        let mut enc = GwacEncoder::new("001", "002");
        let cmd = enc.slew(0.5, -5.25);
        assert!(cmd.line.starts_with("g#001002slew0005000%-0052500%"));
    }

    #[test]
    fn negative_hour_angle_wraps() {
        let mut enc = GwacEncoder::new("001", "001");
        let cmd = enc.slew_ha(-10.0, 0.0);
        assert!(cmd.line.starts_with("g#001001HA3500000%+0000000%"));
    }

    #[test]
    fn serial_wraps_to_one() {
        let mut enc = GwacEncoder::new("001", "001");
        enc.sn = SERIAL_MAX - 1;
        assert_eq!(enc.park().serial, SERIAL_MAX);
        let cmd = enc.park();
        assert_eq!(cmd.serial, 1);
        assert!(cmd.line.ends_with("%00001%\n"));
    }

    #[test]
    fn encoded_serial_round_trips_through_response() {
        let mut enc = GwacEncoder::new("001", "004");
        let cmd = enc.abort_slew();
        let rsp = format!("g#001004abortslewRec%2024-03-29%13:07:27%{:05}%", cmd.serial);
        let frame = GwacFrame::parse(&rsp).unwrap();
        assert_eq!(frame.serial, cmd.serial);
        assert_eq!(frame.body, GwacBody::Response);
    }

    #[test]
    fn fwhm_payload_is_fixed_point_with_image_time() {
        let mut enc = GwacEncoder::new("001", "001");
        let tm = NaiveDateTime::parse_from_str("2024-03-29T13:07:26", "%Y-%m-%dT%H:%M:%S").unwrap();
        let cmd = enc.fwhm("001", 2.345, tm);
        assert!(cmd.line.starts_with("g#001001fwhm001002345T130726000%"));
        assert_eq!(cmd.device, GwacDevice::Focus);
    }

    #[test]
    fn focus_command_is_signed_relative_steps() {
        let mut enc = GwacEncoder::new("002", "006");
        let cmd = enc.focus("061", -30);
        assert!(cmd.line.starts_with("g#002006focus061-0030%"));
    }

    #[test]
    fn track_vel_uses_milli_units() {
        let mut enc = GwacEncoder::new("001", "001");
        let cmd = enc.track_vel(0.004, -0.012);
        assert!(cmd.line.starts_with("g#001001trackvel+00004%-00012%"));
    }
}

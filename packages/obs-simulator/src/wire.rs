//! Small helpers for the positional dialect on the device side.

use chrono::Utc;

/// `%date%time%serial%\n` tail of every positional frame.
pub fn tail(serial: u32) -> String {
    let now = Utc::now();
    format!(
        "%{}%{}%{:05}%\n",
        now.format("%Y-%m-%d"),
        now.format("%H:%M:%S"),
        serial
    )
}

/// Acknowledge a received command by echoing its verb with `Rec` and the
/// same serial.
pub fn ack(gid: &str, uid: &str, verb: &str, serial: &str) -> String {
    let now = Utc::now();
    format!(
        "g#{gid}{uid}{verb}Rec%{}%{}%{serial}%\n",
        now.format("%Y-%m-%d"),
        now.format("%H:%M:%S")
    )
}

/// A command as seen by a device: unit, verb, payload and serial.
#[derive(Debug)]
pub struct DeviceCmd {
    pub uid: String,
    pub verb: String,
    pub payload: String,
    pub serial: String,
}

/// Split `g#GGGUUU<verb><payload>%...%serial%` from the device's point of
/// view. Returns `None` for anything that is not a command for `gid`.
pub fn split_cmd(line: &str, gid: &str) -> Option<DeviceCmd> {
    let line = line.trim_end_matches(['\n', '\r']);
    let head = line.strip_prefix("g#")?.strip_prefix(gid)?;
    let inner = head.strip_suffix('%')?;
    let fields: Vec<&str> = inner.split('%').collect();
    if fields.len() < 4 {
        return None;
    }
    let serial = fields[fields.len() - 1].to_string();
    let lead = fields[0];
    if lead.len() < 3 {
        return None;
    }
    let uid = lead[..3].to_string();
    let rest = &lead[3..];
    let verb: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let payload = format!(
        "{}{}",
        &rest[verb.len()..],
        if fields.len() > 4 {
            format!("%{}", fields[1..fields.len() - 3].join("%"))
        } else {
            String::new()
        }
    );
    if verb.is_empty() {
        return None;
    }
    Some(DeviceCmd {
        uid,
        verb,
        payload,
        serial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_slew_command() {
        let cmd = split_cmd(
            "g#001002slew0100000%+0200000%2024-03-29%13:07:26%00001%\n",
            "001",
        )
        .unwrap();
        assert_eq!(cmd.uid, "002");
        assert_eq!(cmd.verb, "slew");
        assert_eq!(cmd.serial, "00001");
        assert!(cmd.payload.starts_with("0100000%+0200000"));
    }

    #[test]
    fn splits_bare_verb() {
        let cmd = split_cmd("g#001002park%2024-03-29%13:07:26%00002%\n", "001").unwrap();
        assert_eq!(cmd.verb, "park");
        assert_eq!(cmd.serial, "00002");
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn rejects_foreign_group() {
        assert!(split_cmd("g#002001park%2024-03-29%13:07:26%00002%\n", "001").is_none());
    }
}

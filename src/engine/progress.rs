//! Splits ffmpeg stderr (run with `-progress pipe:2`) into log lines and
//! progress ratios.

use regex_lite::Regex;

#[derive(Debug, PartialEq)]
pub enum ParsedLine {
    Log,
    Progress(f64),
    /// A progress report field that carries no completion information.
    Ignored,
}

pub struct ProgressParser {
    duration_us: Option<u64>,
    duration_re: Regex,
    key_value_re: Regex,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            duration_us: None,
            duration_re: Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")
                .expect("valid duration regex"),
            key_value_re: Regex::new(r"^([a-z0-9_]+)=(\S*)$").expect("valid progress regex"),
        }
    }

    pub fn duration_us(&self) -> Option<u64> {
        self.duration_us
    }

    pub fn parse(&mut self, line: &str) -> ParsedLine {
        let line = line.trim_end();
        if let Some(caps) = self.key_value_re.captures(line.trim_start()) {
            return self.parse_field(&caps[1], &caps[2]);
        }
        if self.duration_us.is_none() {
            if let Some(caps) = self.duration_re.captures(line) {
                self.duration_us = parse_duration(&caps[1], &caps[2], &caps[3]);
            }
        }
        ParsedLine::Log
    }

    fn parse_field(&self, key: &str, value: &str) -> ParsedLine {
        match key {
            // out_time_ms is microseconds as well
            "out_time_us" | "out_time_ms" => {
                let (Some(total), Ok(done)) = (self.duration_us, value.parse::<i64>()) else {
                    return ParsedLine::Ignored;
                };
                if total == 0 || done < 0 {
                    return ParsedLine::Ignored;
                }
                ParsedLine::Progress((done as f64 / total as f64).min(1.0))
            }
            "progress" if value == "end" => ParsedLine::Progress(1.0),
            _ => ParsedLine::Ignored,
        }
    }
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_duration(h: &str, m: &str, s: &str) -> Option<u64> {
    let h: u64 = h.parse().ok()?;
    let m: u64 = m.parse().ok()?;
    let s: f64 = s.parse().ok()?;
    Some((h * 3600 + m * 60) * 1_000_000 + (s * 1_000_000.0).round() as u64)
}

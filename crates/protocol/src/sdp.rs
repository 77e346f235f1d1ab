use std::sync::OnceLock;

use regex::Regex;

fn opus_rtpmap_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"a=rtpmap:(\d+) opus/48000/2").expect("static regex"))
}

/// Force the Opus media section of an SDP to mono.
///
/// Finds the payload type mapped to `opus/48000/2` and ensures its `fmtp`
/// line carries `stereo=0;sprop-stereo=0`, creating the line after the
/// `rtpmap` if the offer had none. Idempotent: an SDP that already carries
/// the mono parameters is returned unchanged.
pub fn force_opus_mono(sdp: &str) -> String {
    let Some(caps) = opus_rtpmap_re().captures(sdp) else {
        return sdp.to_string();
    };
    let payload_type = &caps[1];

    // `.` would swallow the `\r` of a CRLF line ending, so match explicitly
    let fmtp_re =
        Regex::new(&format!(r"a=fmtp:{payload_type} ([^\r\n]+)")).expect("static regex");
    if let Some(fmtp) = fmtp_re.captures(sdp) {
        if fmtp[1].contains("stereo=0") {
            return sdp.to_string();
        }
        return fmtp_re
            .replace(sdp, format!("a=fmtp:{payload_type} $1;stereo=0;sprop-stereo=0"))
            .into_owned();
    }

    let rtpmap_re =
        Regex::new(&format!(r"(a=rtpmap:{payload_type} opus/48000/2)")).expect("static regex");
    rtpmap_re
        .replace(
            sdp,
            format!("$1\r\na=fmtp:{payload_type} stereo=0;sprop-stereo=0"),
        )
        .into_owned()
}

/// A parsed ICE candidate attribute.
///
/// The wire form is `candidate:<foundation> <component> <protocol>
/// <priority> <ip> <port> typ <type> ...`; everything past the type is
/// carried opaquely by the full string and not modeled here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub typ: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("candidate has {0} tokens, need at least 8")]
    TooShort(usize),
    #[error("candidate does not start with 'candidate:'")]
    MissingPrefix,
    #[error("expected 'typ' at token 6, found {0:?}")]
    MissingTyp(String),
    #[error("invalid numeric field {field}: {value:?}")]
    BadNumber { field: &'static str, value: String },
}

/// Parse and validate an ICE candidate attribute string.
pub fn parse_candidate(s: &str) -> Result<ParsedCandidate, CandidateError> {
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() < 8 {
        return Err(CandidateError::TooShort(parts.len()));
    }
    let foundation = parts[0]
        .strip_prefix("candidate:")
        .ok_or(CandidateError::MissingPrefix)?;
    if parts[6] != "typ" {
        return Err(CandidateError::MissingTyp(parts[6].to_string()));
    }

    let number = |field: &'static str, value: &str| -> Result<u64, CandidateError> {
        value.parse().map_err(|_| CandidateError::BadNumber {
            field,
            value: value.to_string(),
        })
    };

    Ok(ParsedCandidate {
        foundation: foundation.to_string(),
        component: number("component", parts[1])? as u16,
        protocol: parts[2].to_string(),
        priority: number("priority", parts[3])? as u32,
        ip: parts[4].to_string(),
        port: number("port", parts[5])? as u16,
        typ: parts[7].to_string(),
    })
}

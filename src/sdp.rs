//! SDP adjustment helpers
//!
//! Locally created offers are rewritten before they are sent: a bandwidth cap
//! for the video section and, optionally, payload reordering so the service's
//! preferred codec wins negotiation. Pure string transforms; the SDP grammar
//! handled here is the line-oriented subset the `webrtc` crate emits.

use crate::config::VideoCodec;

/// Insert or replace `b=AS:`/`b=TIAS:` lines in the video media section
///
/// Bandwidth lines belong after the `c=` line of the section when one is
/// present, otherwise directly after the `m=` line. Existing bandwidth lines
/// in the video section are dropped first.
pub fn apply_video_bitrate(sdp: &str, kbps: u32) -> String {
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out: Vec<String> = Vec::new();
    let mut in_video = false;
    let mut inserted = false;

    for line in sdp.lines() {
        if line.starts_with("m=") {
            // Entering a new media section; if we left the video section
            // without inserting (no c= line), that was handled on entry below.
            in_video = line.starts_with("m=video");
            out.push(line.to_string());
            if in_video {
                inserted = false;
            }
            continue;
        }

        if in_video {
            if line.starts_with("b=AS:") || line.starts_with("b=TIAS:") {
                continue;
            }
            out.push(line.to_string());
            if !inserted && line.starts_with("c=") {
                out.push(format!("b=AS:{}", kbps));
                out.push(format!("b=TIAS:{}", kbps as u64 * 1000));
                inserted = true;
            }
            continue;
        }

        out.push(line.to_string());
    }

    // Video section without a c= line: place bandwidth right after m=video.
    if !inserted {
        if let Some(pos) = out.iter().position(|l| l.starts_with("m=video")) {
            out.insert(pos + 1, format!("b=TIAS:{}", kbps as u64 * 1000));
            out.insert(pos + 1, format!("b=AS:{}", kbps));
        }
    }

    let mut result = out.join(newline);
    result.push_str(newline);
    result
}

/// Reorder the video `m=` line so the preferred codec's payload types (and
/// their RTX payloads) come first
///
/// Leaves the SDP untouched when the codec does not appear in the offer.
pub fn prefer_video_codec(sdp: &str, codec: VideoCodec) -> String {
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let name = codec.sdp_name();

    // Payload types whose rtpmap names the codec, scoped to the video section.
    let mut preferred: Vec<String> = Vec::new();
    let mut in_video = false;
    for line in sdp.lines() {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
            continue;
        }
        if !in_video {
            continue;
        }
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.splitn(2, ' ');
            if let (Some(pt), Some(desc)) = (parts.next(), parts.next()) {
                let codec_name = desc.split('/').next().unwrap_or("");
                if codec_name.eq_ignore_ascii_case(name) {
                    preferred.push(pt.to_string());
                }
            }
        }
    }

    if preferred.is_empty() {
        return sdp.to_string();
    }

    // RTX payloads referencing a preferred payload ride along.
    let mut rtx: Vec<String> = Vec::new();
    in_video = false;
    for line in sdp.lines() {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
            continue;
        }
        if !in_video {
            continue;
        }
        if let Some(rest) = line.strip_prefix("a=fmtp:") {
            let mut parts = rest.splitn(2, ' ');
            if let (Some(pt), Some(params)) = (parts.next(), parts.next()) {
                if let Some(apt) = params.strip_prefix("apt=") {
                    if preferred.iter().any(|p| p == apt.trim()) {
                        rtx.push(pt.to_string());
                    }
                }
            }
        }
    }

    let lines: Vec<String> = sdp
        .lines()
        .map(|line| {
            if !line.starts_with("m=video") {
                return line.to_string();
            }
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() <= 3 {
                return line.to_string();
            }
            let (head, payloads) = fields.split_at(3);
            let mut reordered: Vec<&str> = Vec::with_capacity(payloads.len());
            for &pt in payloads {
                if preferred.iter().any(|p| p == pt) || rtx.iter().any(|p| p == pt) {
                    reordered.push(pt);
                }
            }
            for &pt in payloads {
                if !reordered.contains(&pt) {
                    reordered.push(pt);
                }
            }
            let mut rebuilt: Vec<&str> = head.to_vec();
            rebuilt.extend(reordered);
            rebuilt.join(" ")
        })
        .collect();

    let mut result = lines.join(newline);
    result.push_str(newline);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 42 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99\r\n\
c=IN IP4 0.0.0.0\r\n\
b=AS:512\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 H264/90000\r\n\
a=rtpmap:99 rtx/90000\r\n\
a=fmtp:99 apt=98\r\n";

    #[test]
    fn test_bitrate_replaces_existing() {
        let out = apply_video_bitrate(OFFER, 2000);
        assert!(out.contains("b=AS:2000\r\n"));
        assert!(out.contains("b=TIAS:2000000\r\n"));
        assert!(!out.contains("b=AS:512"));
    }

    #[test]
    fn test_bitrate_only_touches_video_section() {
        let out = apply_video_bitrate(OFFER, 2000);
        let audio_section: String = out
            .lines()
            .skip_while(|l| !l.starts_with("m=audio"))
            .take_while(|l| !l.starts_with("m=video"))
            .collect();
        assert!(!audio_section.contains("b=AS"));
    }

    #[test]
    fn test_bitrate_follows_connection_line() {
        let out = apply_video_bitrate(OFFER, 1500);
        let lines: Vec<&str> = out.lines().collect();
        let c_pos = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with("c="))
            .map(|(i, _)| i)
            .last()
            .unwrap();
        assert_eq!(lines[c_pos + 1], "b=AS:1500");
    }

    #[test]
    fn test_bitrate_without_connection_line() {
        let sdp = "v=0\nm=video 9 UDP/TLS/RTP/SAVPF 96\na=rtpmap:96 VP8/90000\n";
        let out = apply_video_bitrate(sdp, 900);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("v=0"));
        assert_eq!(lines[2], "b=AS:900");
    }

    #[test]
    fn test_prefer_h264_reorders_payloads() {
        let out = prefer_video_codec(OFFER, VideoCodec::H264);
        let video_line = out.lines().find(|l| l.starts_with("m=video")).unwrap();
        // H264 (98) and its RTX (99) lead; VP8 (96) and its RTX (97) follow.
        assert_eq!(video_line, "m=video 9 UDP/TLS/RTP/SAVPF 98 99 96 97");
    }

    #[test]
    fn test_prefer_missing_codec_is_noop() {
        let out = prefer_video_codec(OFFER, VideoCodec::Vp9);
        assert_eq!(out, OFFER);
    }

    #[test]
    fn test_prefer_does_not_touch_audio() {
        let out = prefer_video_codec(OFFER, VideoCodec::H264);
        let audio_line = out.lines().find(|l| l.starts_with("m=audio")).unwrap();
        assert_eq!(audio_line, "m=audio 9 UDP/TLS/RTP/SAVPF 111");
    }
}
